use crate::model::symbol::Symbol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cascade/OI/profile alert severity.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum Severity {
    Low,
    Med,
    High,
    Critical,
}

impl Severity {
    /// Coarse bucket used in [`AlertEnvelope::dedup_key`] so near-identical
    /// severities collapse to the same dedup bucket.
    pub fn bucket(&self) -> u8 {
        *self as u8
    }
}

/// What triggered an [`AlertEnvelope`].
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub enum AlertKind {
    CascadeWatch,
    CascadeAlert,
    CascadeCritical,
    CascadeExtreme,
    CascadeEasing,
    ExchangeDominance,
    CrossExchangeSkew,
    ProfileAnomaly,
    DeliveryFailed,
    Backpressure,
}

/// `(kind, symbol, severity_bucket)` — the tuple by which the dispatcher
/// suppresses repeated alerts within a window.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub struct DedupKey {
    pub kind: AlertKind,
    pub symbol: Symbol,
    pub severity_bucket: u8,
}

/// Dispatcher output unit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlertEnvelope {
    pub kind: AlertKind,
    pub symbol: Symbol,
    pub severity: Severity,
    pub ts: DateTime<Utc>,
    pub payload: AlertPayload,
}

impl AlertEnvelope {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            kind: self.kind.clone(),
            symbol: self.symbol.clone(),
            severity_bucket: self.severity.bucket(),
        }
    }
}

/// Alert body. Every liquidation-derived value carries both `value_usd` and
/// `value_tokens` — the core emits both and leaves unit choice to the
/// consumer rendering the alert.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AlertPayload {
    Cascade {
        probability: f64,
        leading_exchange: Option<String>,
        value_usd: f64,
        value_tokens: f64,
    },
    OiDiscrepancy {
        message: String,
    },
    Profile {
        message: String,
    },
    Diagnostic {
        message: String,
    },
}

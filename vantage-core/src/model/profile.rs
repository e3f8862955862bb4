use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recognized profile timeframes, each with a fixed candle count and bin
/// count.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Deserialize, Serialize)]
pub enum Timeframe {
    M1,
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn candles(&self) -> usize {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M15 => 96,
            Timeframe::H1 => 168,
            Timeframe::H4 => 84,
            Timeframe::D1 => 30,
        }
    }

    pub fn bins(&self) -> usize {
        match self {
            Timeframe::M1 => 20,
            Timeframe::M15 => 24,
            Timeframe::H1 => 24,
            Timeframe::H4 => 30,
            Timeframe::D1 => 50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "1m" => Some(Timeframe::M1),
            "15m" => Some(Timeframe::M15),
            "1h" => Some(Timeframe::H1),
            "4h" => Some(Timeframe::H4),
            "1d" => Some(Timeframe::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per (symbol, timeframe) output of the Profile & VWAP Calculator.
/// `status` distinguishes a fully-computed profile from
/// one degraded by too little data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: ProfileStatus,
    pub volume_profile: ValueAreaProfile,
    pub tpo_profile: ValueAreaProfile,
    pub session_vwap: Option<f64>,
    pub candle_count: usize,
    pub session_start_utc: DateTime<Utc>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ProfileStatus {
    Ok,
    /// Fewer than 2 candles were available.
    InsufficientData,
}

/// POC/VAH/VAL triple shared by both the volume profile and the TPO
/// profile, since the value-area expansion algorithm is identical for each.
/// Invariant: `val <= poc <= vah`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ValueAreaProfile {
    pub poc: f64,
    pub vah: f64,
    pub val: f64,
    pub value_area_pct: f64,
}

impl ValueAreaProfile {
    pub fn invariant_holds(&self) -> bool {
        self.val <= self.poc && self.poc <= self.vah
    }
}

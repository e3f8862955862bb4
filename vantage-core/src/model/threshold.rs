use serde::{Deserialize, Serialize};

/// Market-cap tier used to scale thresholds without per-asset code changes.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub enum Tier {
    /// Market cap > $100B
    T1,
    /// Market cap > $10B
    T2,
    /// Market cap > $1B
    T3,
    /// Market cap <= $1B
    T4,
}

impl Tier {
    pub fn from_market_cap_usd(market_cap_usd: f64) -> Self {
        if market_cap_usd > 100_000_000_000.0 {
            Tier::T1
        } else if market_cap_usd > 10_000_000_000.0 {
            Tier::T2
        } else if market_cap_usd > 1_000_000_000.0 {
            Tier::T3
        } else {
            Tier::T4
        }
    }

    /// Base liquidation ratio applied to daily volume.
    pub fn base_liquidation_ratio(&self) -> f64 {
        match self {
            Tier::T1 => 0.0005,
            Tier::T2 => 0.001,
            Tier::T3 => 0.002,
            Tier::T4 => 0.005,
        }
    }
}

/// Per-symbol, session- and volatility-adjusted thresholds,
/// resolved by the [`ThresholdEngine`](crate::threshold_engine::ThresholdEngine)
/// and cached for up to one hour or until the config generation changes.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub liq_single_usd: f64,
    pub liq_cascade_count: u32,
    pub liq_cascade_usd: f64,
    pub oi_change_pct: f64,
    pub oi_min_usd: f64,
    pub vol_spike_multiplier: f64,
}

/// Floor below which `liq_single_usd` never drops regardless of tier/session
/// scaling.
pub const LIQ_SINGLE_USD_FLOOR: f64 = 5_000.0;

/// `cascade_threshold_usd = 5 * single_threshold`.
pub const CASCADE_USD_MULTIPLIER: f64 = 5.0;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV tuple. A sequence of [`Candle`]s is expected to be
/// strictly monotonic in `ts_open` and gapless modulo the stated interval;
/// that invariant is the provider layer's responsibility to uphold, not
/// enforced by this type itself.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Candle {
    pub ts_open: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// `low <= open,close <= high`, `volume >= 0`.
    pub fn is_well_formed(&self) -> bool {
        self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
            && self.volume >= 0.0
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            ts_open: Utc::now(),
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn well_formed_candle_passes() {
        assert!(candle(100.0, 110.0, 95.0, 105.0, 10.0).is_well_formed());
    }

    #[test]
    fn inverted_high_low_fails() {
        assert!(!candle(100.0, 90.0, 95.0, 92.0, 10.0).is_well_formed());
    }

    #[test]
    fn negative_volume_fails() {
        assert!(!candle(100.0, 110.0, 95.0, 105.0, -1.0).is_well_formed());
    }

    #[test]
    fn typical_price_is_average_of_hlc() {
        let c = candle(100.0, 110.0, 90.0, 100.0, 5.0);
        assert!((c.typical_price() - 100.0).abs() < 1e-9);
    }
}

//! Volume profile, TPO profile and session VWAP, computed on demand from a
//! candle array handed down by the provider layer. Purely functional — no
//! subsystem here holds state between calls.

use crate::model::candle::Candle;
use crate::model::profile::{ProfileSnapshot, ProfileStatus, Timeframe, ValueAreaProfile};
use crate::model::symbol::Symbol;
use chrono::{DateTime, Utc};

/// Fixed level count for the TPO profile, independent of the volume
/// profile's per-timeframe bin count.
const TPO_LEVELS: usize = 100;

/// Fraction of total volume/TPO count the value area must cover.
const VALUE_AREA_TARGET: f64 = 0.70;

pub fn compute(symbol: &Symbol, timeframe: Timeframe, candles: &[Candle]) -> ProfileSnapshot {
    let session_start_utc = midnight_utc_session_start();

    if candles.len() < 2 {
        let flat = ValueAreaProfile { poc: 0.0, vah: 0.0, val: 0.0, value_area_pct: 0.0 };
        return ProfileSnapshot {
            symbol: symbol.to_string(),
            timeframe,
            status: ProfileStatus::InsufficientData,
            volume_profile: flat,
            tpo_profile: flat,
            session_vwap: None,
            candle_count: candles.len(),
            session_start_utc,
        };
    }

    let lo = candles.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let hi = candles.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);

    let (volume_profile, tpo_profile) = if hi <= lo {
        let degenerate = ValueAreaProfile { poc: hi, vah: hi, val: hi, value_area_pct: 100.0 };
        (degenerate, degenerate)
    } else {
        let volume_bins = spread_volume(candles, lo, hi, timeframe.bins());
        let tpo_counts = count_tpo(candles, lo, hi, TPO_LEVELS);
        (build_value_area(&volume_bins, lo, hi), build_value_area(&tpo_counts, lo, hi))
    };

    ProfileSnapshot {
        symbol: symbol.to_string(),
        timeframe,
        status: ProfileStatus::Ok,
        volume_profile,
        tpo_profile,
        session_vwap: session_vwap(candles, session_start_utc),
        candle_count: candles.len(),
        session_start_utc,
    }
}

fn midnight_utc_session_start() -> DateTime<Utc> {
    Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always a valid time")
        .and_utc()
}

fn session_vwap(candles: &[Candle], session_start_utc: DateTime<Utc>) -> Option<f64> {
    let (numerator, denominator) = candles
        .iter()
        .filter(|c| c.ts_open >= session_start_utc)
        .fold((0.0, 0.0), |(num, den), c| (num + c.typical_price() * c.volume, den + c.volume));

    (denominator > 0.0).then_some(numerator / denominator)
}

/// Spreads each candle's volume across the bins its `[low, high]` range
/// overlaps, proportional to the overlap width. A flat candle (`high ==
/// low`) deposits its whole volume in the bin containing `close`.
fn spread_volume(candles: &[Candle], lo: f64, hi: f64, bins: usize) -> Vec<f64> {
    let bin_width = (hi - lo) / bins as f64;
    let mut volume = vec![0.0; bins];

    for candle in candles {
        if candle.high <= candle.low {
            volume[bin_index(candle.close, lo, bin_width, bins)] += candle.volume;
            continue;
        }
        let range = candle.high - candle.low;
        for (i, slot) in volume.iter_mut().enumerate() {
            let bin_lo = lo + i as f64 * bin_width;
            let bin_hi = bin_lo + bin_width;
            let overlap = (candle.high.min(bin_hi) - candle.low.max(bin_lo)).max(0.0);
            if overlap > 0.0 {
                *slot += candle.volume * overlap / range;
            }
        }
    }

    volume
}

/// Every price level a candle's `[low, high]` range intersects gets one TPO
/// count, regardless of how much of the level it covers.
fn count_tpo(candles: &[Candle], lo: f64, hi: f64, levels: usize) -> Vec<f64> {
    let level_width = (hi - lo) / levels as f64;
    let mut counts = vec![0.0; levels];

    for candle in candles {
        for (i, slot) in counts.iter_mut().enumerate() {
            let level_lo = lo + i as f64 * level_width;
            let level_hi = level_lo + level_width;
            if candle.high >= level_lo && candle.low <= level_hi {
                *slot += 1.0;
            }
        }
    }

    counts
}

fn bin_index(price: f64, lo: f64, bin_width: f64, bins: usize) -> usize {
    if bin_width <= 0.0 {
        return 0;
    }
    (((price - lo) / bin_width) as usize).min(bins - 1)
}

/// POC, then value-area expansion: at each step compare the summed weight
/// of the two slots just above the current interval against the two just
/// below, and extend into whichever side is heavier, until the accumulated
/// weight clears 70% of the total.
fn build_value_area(weights: &[f64], lo: f64, hi: f64) -> ValueAreaProfile {
    let slots = weights.len();
    let slot_width = (hi - lo) / slots as f64;
    let total: f64 = weights.iter().sum();

    if total <= 0.0 {
        let mid = (lo + hi) / 2.0;
        return ValueAreaProfile { poc: mid, vah: mid, val: mid, value_area_pct: 0.0 };
    }

    let poc_index = weights
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let mut low = poc_index;
    let mut high = poc_index;
    let mut accumulated = weights[poc_index];
    let target = total * VALUE_AREA_TARGET;

    while accumulated < target {
        let above = above_neighbors(high, slots);
        let below = below_neighbors(low);
        if above.is_empty() && below.is_empty() {
            break;
        }

        let sum_above: f64 = above.iter().map(|&i| weights[i]).sum();
        let sum_below: f64 = below.iter().map(|&i| weights[i]).sum();

        let extend_above = if above.is_empty() {
            false
        } else if below.is_empty() {
            true
        } else {
            sum_above >= sum_below
        };

        if extend_above {
            high = *above.iter().max().expect("checked non-empty");
            accumulated += sum_above;
        } else {
            low = *below.iter().min().expect("checked non-empty");
            accumulated += sum_below;
        }
    }

    ValueAreaProfile {
        poc: lo + (poc_index as f64 + 0.5) * slot_width,
        vah: lo + (high + 1) as f64 * slot_width,
        val: lo + low as f64 * slot_width,
        value_area_pct: (accumulated / total) * 100.0,
    }
}

fn above_neighbors(high: usize, slots: usize) -> Vec<usize> {
    ((high + 1)..slots).take(2).collect()
}

fn below_neighbors(low: usize) -> Vec<usize> {
    let mut out = Vec::with_capacity(2);
    let mut i = low;
    while out.len() < 2 {
        if i == 0 {
            break;
        }
        i -= 1;
        out.push(i);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts_open: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle { ts_open, open, high, low, close, volume }
    }

    #[test]
    fn fewer_than_two_candles_is_insufficient_data() {
        let symbol = Symbol::new("BTC");
        let candles = vec![candle(Utc::now(), 100.0, 101.0, 99.0, 100.5, 10.0)];

        let snapshot = compute(&symbol, Timeframe::M1, &candles);

        assert_eq!(snapshot.status, ProfileStatus::InsufficientData);
        assert_eq!(snapshot.candle_count, 1);
        assert!(snapshot.session_vwap.is_none());
    }

    #[test]
    fn flat_range_yields_degenerate_profile_at_the_single_price() {
        let symbol = Symbol::new("BTC");
        let candles = vec![
            candle(Utc::now(), 100.0, 100.0, 100.0, 100.0, 5.0),
            candle(Utc::now(), 100.0, 100.0, 100.0, 100.0, 7.0),
        ];

        let snapshot = compute(&symbol, Timeframe::M1, &candles);

        assert_eq!(snapshot.status, ProfileStatus::Ok);
        assert_eq!(snapshot.volume_profile.poc, 100.0);
        assert_eq!(snapshot.volume_profile.vah, 100.0);
        assert_eq!(snapshot.volume_profile.val, 100.0);
        assert_eq!(snapshot.volume_profile.value_area_pct, 100.0);
    }

    #[test]
    fn zero_volume_falls_back_to_mid_price_with_zero_value_area() {
        let weights = vec![0.0; 20];
        let area = build_value_area(&weights, 90.0, 110.0);

        assert!((area.poc - 100.0).abs() < 1e-9);
        assert!((area.vah - 100.0).abs() < 1e-9);
        assert!((area.val - 100.0).abs() < 1e-9);
        assert_eq!(area.value_area_pct, 0.0);
    }

    #[test]
    fn value_area_invariant_holds_and_covers_at_least_seventy_percent() {
        let symbol = Symbol::new("ETH");
        let mut candles = Vec::new();
        let base = Utc::now();
        for i in 0..30 {
            let price = 2_000.0 + (i % 5) as f64 * 10.0;
            candles.push(candle(base, price - 2.0, price + 2.0, price - 2.0, price, 100.0 + i as f64));
        }

        let snapshot = compute(&symbol, Timeframe::M1, &candles);

        assert_eq!(snapshot.status, ProfileStatus::Ok);
        assert!(snapshot.volume_profile.invariant_holds());
        assert!(snapshot.volume_profile.value_area_pct >= 70.0 - 1e-6);
        assert!(snapshot.tpo_profile.invariant_holds());
    }

    #[test]
    fn vwap_only_counts_candles_in_the_current_utc_session() {
        let symbol = Symbol::new("BTC");
        let session_start = midnight_utc_session_start();
        let before_session = session_start - chrono::Duration::hours(1);

        let candles = vec![
            candle(before_session, 90.0, 92.0, 88.0, 90.0, 1_000.0),
            candle(session_start + chrono::Duration::minutes(5), 100.0, 102.0, 98.0, 100.0, 10.0),
            candle(session_start + chrono::Duration::minutes(10), 100.0, 102.0, 98.0, 100.0, 10.0),
        ];

        let snapshot = compute(&symbol, Timeframe::M1, &candles);

        let vwap = snapshot.session_vwap.expect("session has volume");
        assert!((vwap - 100.0).abs() < 1e-6);
    }

    #[test]
    fn spread_volume_splits_proportionally_across_overlapping_bins() {
        let candles = vec![candle(Utc::now(), 100.0, 110.0, 90.0, 105.0, 20.0)];
        let bins = spread_volume(&candles, 90.0, 110.0, 2);

        assert_eq!(bins.len(), 2);
        assert!((bins[0] - 10.0).abs() < 1e-6);
        assert!((bins[1] - 10.0).abs() < 1e-6);
    }

    #[test]
    fn tpo_counts_one_per_intersecting_candle() {
        let candles = vec![
            candle(Utc::now(), 100.0, 105.0, 95.0, 100.0, 1.0),
            candle(Utc::now(), 100.0, 103.0, 97.0, 100.0, 1.0),
        ];
        let counts = count_tpo(&candles, 90.0, 110.0, 2);

        assert_eq!(counts.len(), 2);
        assert!(counts.iter().all(|&c| c >= 1.0));
    }
}

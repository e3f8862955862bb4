//! Liquidation cascade detection: six rolling [`TimeframeWindow`]s per
//! symbol feed a weighted probability score, mapped through a severity
//! state machine that only ever emits on a level transition.
//!
//! The pure scoring/FSM logic lives in [`CascadeDetector`] and is fully
//! synchronous and deterministic given its inputs, so it is unit-tested
//! directly. [`actor`] wraps it with the channel-driven, single-owner task
//! shape described for per-symbol mutable state.

pub mod actor;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use crate::model::liquidation::{CompactLiquidation, Scale};

/// The six window durations tracked per symbol, shortest first.
pub const WINDOW_DURATIONS_MS: [u64; 6] = [100, 500, 2_000, 10_000, 60_000, 300_000];

const IDX_100MS: usize = 0;
const IDX_500MS: usize = 1;
const IDX_2S: usize = 2;
const IDX_10S: usize = 3;
const IDX_60S: usize = 4;
const IDX_300S: usize = 5;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum Severity {
    Idle = 0,
    Watch = 1,
    Alert = 2,
    Critical = 3,
    Extreme = 4,
}

impl Severity {
    fn from_probability(p: f64) -> Self {
        if p >= 0.90 {
            Severity::Extreme
        } else if p >= 0.70 {
            Severity::Critical
        } else if p >= 0.50 {
            Severity::Alert
        } else if p >= 0.30 {
            Severity::Watch
        } else {
            Severity::Idle
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SignalKind {
    /// The severity level went up.
    Escalation,
    /// The severity level dropped by two or more levels, or the symbol
    /// went quiet and was force-reset to `Idle`.
    Easing,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CascadeSignal {
    pub symbol_id: u16,
    pub kind: SignalKind,
    pub severity: Severity,
    pub probability: f64,
    pub leading_exchange_id: Option<u8>,
    pub cross_exchange_correlation: f64,
    /// Raw USD sum liquidated over the current half of the 2s window that
    /// triggered this signal. Zero for the quiet-period reset path, which has
    /// no triggering window.
    pub value_usd: f64,
    /// Same burst, in underlying token quantity.
    pub value_tokens: f64,
    pub ts_ms: u64,
}

/// Scoring reference values and policy knobs, tier/session/volatility-scaled
/// by the threshold engine in production; a plain default here for
/// standalone use and tests.
#[derive(Clone, Copy, Debug)]
pub struct CascadeThresholds {
    pub events_per_sec: f64,
    pub accel: f64,
    pub usd_per_sec: f64,
    pub funding_extreme: f64,
    pub oi_change_pct: f64,
    pub quiet_period: Duration,
    pub lag_tolerance: Duration,
}

impl Default for CascadeThresholds {
    fn default() -> Self {
        Self {
            events_per_sec: 5.0,
            accel: 2.0,
            usd_per_sec: 50_000.0,
            funding_extreme: 0.01,
            oi_change_pct: 0.05,
            quiet_period: Duration::from_secs(60),
            lag_tolerance: Duration::from_secs(10),
        }
    }
}

fn normalize(x: f64, reference: f64) -> f64 {
    if reference <= 0.0 {
        return 0.0;
    }
    (x / reference).min(1.0)
}

#[derive(Copy, Clone, Debug)]
struct WindowEvent {
    ts_ms: u64,
    value_usd: f64,
    value_tokens: f64,
    exchange_id: u8,
}

/// A single rolling window. Retains up to two window-durations of history
/// so `events_accel`/`usd_accel` can compare the current half against the
/// immediately preceding one. Eviction runs off a monotonic front cursor,
/// amortized O(1) per push.
struct TimeframeWindow {
    duration_ms: u64,
    events: VecDeque<WindowEvent>,
    track_exchanges: bool,
}

struct WindowStats {
    events_per_sec_now: f64,
    events_accel: f64,
    usd_per_sec_now: f64,
}

/// Raw (non-rate) notional sums over the current half of a window, used to
/// report what a triggering burst actually moved rather than its per-second
/// rate.
struct WindowNotional {
    value_usd: f64,
    value_tokens: f64,
}

impl TimeframeWindow {
    fn new(duration_ms: u64, track_exchanges: bool) -> Self {
        Self {
            duration_ms,
            events: VecDeque::new(),
            track_exchanges,
        }
    }

    fn push(&mut self, event: WindowEvent) {
        self.events.push_back(event);
        self.evict(event.ts_ms);
    }

    fn evict(&mut self, now_ms: u64) {
        let retain_from = now_ms.saturating_sub(2 * self.duration_ms);
        while let Some(front) = self.events.front() {
            if front.ts_ms < retain_from {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Splits retained history into (previous half, current half) at
    /// `now_ms`, both half-open `(start, end]`.
    fn halves(&self, now_ms: u64) -> (Vec<WindowEvent>, Vec<WindowEvent>) {
        let current_start = now_ms.saturating_sub(self.duration_ms);
        let prev_start = now_ms.saturating_sub(2 * self.duration_ms);

        let mut prev = Vec::new();
        let mut current = Vec::new();
        for ev in &self.events {
            if ev.ts_ms > current_start && ev.ts_ms <= now_ms {
                current.push(*ev);
            } else if ev.ts_ms > prev_start && ev.ts_ms <= current_start {
                prev.push(*ev);
            }
        }
        (prev, current)
    }

    fn stats(&self, now_ms: u64) -> WindowStats {
        let (prev, current) = self.halves(now_ms);
        let duration_s = self.duration_ms as f64 / 1000.0;

        let events_per_sec_now = current.len() as f64 / duration_s;
        let events_per_sec_prev = prev.len() as f64 / duration_s;
        let usd_per_sec_now = current.iter().map(|e| e.value_usd).sum::<f64>() / duration_s;

        WindowStats {
            events_per_sec_now,
            events_accel: (events_per_sec_now - events_per_sec_prev) / duration_s,
            usd_per_sec_now,
        }
    }

    /// Raw USD/token sums over the current half, for attaching to a signal —
    /// unlike `stats()` these are not divided down to a per-second rate.
    fn current_notional(&self, now_ms: u64) -> WindowNotional {
        let (_, current) = self.halves(now_ms);
        WindowNotional {
            value_usd: current.iter().map(|e| e.value_usd).sum(),
            value_tokens: current.iter().map(|e| e.value_tokens).sum(),
        }
    }

    /// Shannon-entropy concentration score plus leading exchange over the
    /// current half only. `n_exchanges` is the number of venues currently
    /// streaming, not just the ones with events in this window.
    fn cross_exchange_correlation(&self, now_ms: u64, n_exchanges: usize) -> (f64, Option<u8>) {
        if !self.track_exchanges || n_exchanges <= 1 {
            return (1.0, None);
        }

        let (_, current) = self.halves(now_ms);
        if current.is_empty() {
            return (0.0, None);
        }

        let mut counts: HashMap<u8, u32> = HashMap::new();
        let mut usd: HashMap<u8, f64> = HashMap::new();
        for ev in &current {
            *counts.entry(ev.exchange_id).or_insert(0) += 1;
            *usd.entry(ev.exchange_id).or_insert(0.0) += ev.value_usd;
        }

        let total = current.len() as f64;
        let entropy: f64 = counts
            .values()
            .map(|&c| {
                let p = c as f64 / total;
                -p * p.ln()
            })
            .sum();
        let max_entropy = (n_exchanges as f64).ln();
        let correlation = if max_entropy > 0.0 {
            (1.0 - entropy / max_entropy).clamp(0.0, 1.0)
        } else {
            1.0
        };

        let leading = counts
            .iter()
            .max_by(|a, b| {
                a.1.cmp(b.1).then_with(|| {
                    let usd_a = usd.get(a.0).copied().unwrap_or(0.0);
                    let usd_b = usd.get(b.0).copied().unwrap_or(0.0);
                    usd_a.partial_cmp(&usd_b).unwrap_or(std::cmp::Ordering::Equal)
                })
            })
            .map(|(&exchange_id, _)| exchange_id);

        (correlation, leading)
    }

    fn is_empty_recent(&self, now_ms: u64, quiet_period: Duration) -> bool {
        match self.events.back() {
            None => true,
            Some(last) => now_ms.saturating_sub(last.ts_ms) >= quiet_period.as_millis() as u64,
        }
    }
}

/// Per-symbol cascade state: six windows plus the funding/OI context needed
/// for the last two scoring terms.
pub struct CascadeDetector {
    symbol_id: u16,
    windows: [TimeframeWindow; 6],
    latest_funding: Option<f64>,
    oi_change_pct_5m: Option<f64>,
    severity: Severity,
}

impl CascadeDetector {
    pub fn new(symbol_id: u16) -> Self {
        Self {
            symbol_id,
            windows: WINDOW_DURATIONS_MS.map(|d| TimeframeWindow::new(d, d == WINDOW_DURATIONS_MS[IDX_2S])),
            latest_funding: None,
            oi_change_pct_5m: None,
            severity: Severity::Idle,
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn set_funding(&mut self, funding: f64) {
        self.latest_funding = Some(funding);
    }

    pub fn set_oi_change_pct_5m(&mut self, oi_change_pct: f64) {
        self.oi_change_pct_5m = Some(oi_change_pct);
    }

    /// Feed one ingested liquidation into every window and re-score.
    pub fn update(
        &mut self,
        event: CompactLiquidation,
        scale: Scale,
        now_ms: u64,
        thresholds: &CascadeThresholds,
        n_exchanges: usize,
    ) -> Option<CascadeSignal> {
        let window_event = WindowEvent {
            ts_ms: event.ts_ms,
            value_usd: event.value_usd(scale),
            value_tokens: event.quantity(scale),
            exchange_id: event.exchange_id,
        };
        for window in &mut self.windows {
            window.push(window_event);
        }
        self.rescore(now_ms, thresholds, n_exchanges)
    }

    /// Called on a periodic tick (not per-event) to force a quiet-period
    /// reset even when no new liquidations are arriving.
    pub fn tick_quiet(&mut self, now_ms: u64, thresholds: &CascadeThresholds) -> Option<CascadeSignal> {
        if self.severity == Severity::Idle {
            return None;
        }
        if !self.windows[IDX_300S].is_empty_recent(now_ms, thresholds.quiet_period) {
            return None;
        }

        self.severity = Severity::Idle;
        Some(CascadeSignal {
            symbol_id: self.symbol_id,
            kind: SignalKind::Easing,
            severity: Severity::Idle,
            probability: 0.0,
            leading_exchange_id: None,
            cross_exchange_correlation: 0.0,
            value_usd: 0.0,
            value_tokens: 0.0,
            ts_ms: now_ms,
        })
    }

    fn rescore(&mut self, now_ms: u64, thresholds: &CascadeThresholds, n_exchanges: usize) -> Option<CascadeSignal> {
        let stats_500ms = self.windows[IDX_500MS].stats(now_ms);
        let stats_2s = self.windows[IDX_2S].stats(now_ms);

        let velocity_score = normalize(stats_2s.events_per_sec_now, thresholds.events_per_sec);
        let accel_score = normalize(stats_500ms.events_accel.max(stats_2s.events_accel), thresholds.accel);
        let volume_score = normalize(stats_2s.usd_per_sec_now, thresholds.usd_per_sec);
        let (correlation, leading_exchange_id) = self.windows[IDX_2S].cross_exchange_correlation(now_ms, n_exchanges);
        let notional = self.windows[IDX_2S].current_notional(now_ms);

        let mut weighted = 0.25 * velocity_score + 0.20 * accel_score + 0.20 * volume_score + 0.15 * correlation;
        let mut weight_total = 0.25 + 0.20 + 0.20 + 0.15;

        if let Some(funding) = self.latest_funding {
            let funding_score = normalize(funding.abs(), thresholds.funding_extreme);
            weighted += 0.10 * funding_score;
            weight_total += 0.10;
        }
        if let Some(oi_change_pct) = self.oi_change_pct_5m {
            let oi_score = normalize(oi_change_pct.abs(), thresholds.oi_change_pct);
            weighted += 0.10 * oi_score;
            weight_total += 0.10;
        }

        let probability = if weight_total > 0.0 { weighted / weight_total } else { 0.0 };
        let new_severity = Severity::from_probability(probability);
        let from = self.severity;

        if new_severity == from {
            return None;
        }

        self.severity = new_severity;

        let signal = CascadeSignal {
            symbol_id: self.symbol_id,
            kind: if new_severity > from { SignalKind::Escalation } else { SignalKind::Easing },
            severity: new_severity,
            probability,
            leading_exchange_id,
            cross_exchange_correlation: correlation,
            value_usd: notional.value_usd,
            value_tokens: notional.value_tokens,
            ts_ms: now_ms,
        };

        if new_severity > from {
            Some(signal)
        } else if (from as i32 - new_severity as i32) >= 2 {
            Some(signal)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::liquidation::LiqSide;

    fn liq(ts_ms: u64, exchange_id: u8, price: f64, quantity: f64) -> CompactLiquidation {
        CompactLiquidation::encode(ts_ms, 0, exchange_id, LiqSide::Long, price, quantity, Scale::default(), false)
    }

    #[test]
    fn idle_with_no_events() {
        let detector = CascadeDetector::new(0);
        assert_eq!(detector.severity(), Severity::Idle);
    }

    #[test]
    fn burst_of_large_liquidations_escalates_to_watch_or_higher() {
        let mut detector = CascadeDetector::new(0);
        let thresholds = CascadeThresholds::default();
        let scale = Scale::default();

        let mut last_signal = None;
        for i in 0..20u64 {
            let ts = 1_700_000_000_000 + i * 50;
            let event = liq(ts, 0, 60_000.0, 2.0);
            if let Some(signal) = detector.update(event, scale, ts, &thresholds, 1) {
                last_signal = Some(signal);
            }
        }

        assert!(detector.severity() > Severity::Idle);
        let signal = last_signal.expect("expected at least one escalation signal");
        assert_eq!(signal.kind, SignalKind::Escalation);
    }

    #[test]
    fn escalation_signal_carries_the_triggering_burst_notional() {
        let mut detector = CascadeDetector::new(0);
        let thresholds = CascadeThresholds::default();
        let scale = Scale::default();

        let mut last_signal = None;
        for i in 0..20u64 {
            let ts = 1_700_000_000_000 + i * 50;
            let event = liq(ts, 0, 60_000.0, 2.0);
            if let Some(signal) = detector.update(event, scale, ts, &thresholds, 1) {
                last_signal = Some(signal);
            }
        }

        let signal = last_signal.expect("expected at least one escalation signal");
        assert!(signal.value_usd > 0.0, "a triggered cascade signal must report nonzero USD notional");
        assert!(signal.value_tokens > 0.0, "a triggered cascade signal must report nonzero token notional");
        // Each liquidation is 60_000 * 2 = 120_000 USD / 2 tokens; the current
        // half of the 2s window can hold at most a handful of the most
        // recent ones, so the sum is bounded but must reflect real events.
        assert!(signal.value_usd >= 120_000.0);
        assert!(signal.value_tokens >= 2.0);
    }

    #[test]
    fn same_level_twice_in_a_row_never_emits_twice() {
        let mut detector = CascadeDetector::new(0);
        let thresholds = CascadeThresholds::default();
        let scale = Scale::default();

        let ts = 1_700_000_000_000;
        let first = detector.update(liq(ts, 0, 1_200.0, 1.0), scale, ts, &thresholds, 1);
        let second = detector.update(liq(ts + 10, 0, 1_200.0, 1.0), scale, ts + 10, &thresholds, 1);

        if first.is_some() {
            assert!(second.is_none(), "same severity level must not emit twice consecutively");
        }
    }

    #[test]
    fn missing_funding_and_oi_still_yields_bounded_probability() {
        let mut detector = CascadeDetector::new(0);
        let thresholds = CascadeThresholds::default();
        let scale = Scale::default();

        for i in 0..30u64 {
            let ts = 1_700_000_000_000 + i * 30;
            let _ = detector.update(liq(ts, 0, 80_000.0, 5.0), scale, ts, &thresholds, 1);
        }

        // No set_funding/set_oi_change_pct_5m call: renormalized weights
        // must still keep the detector in a valid state with no panics.
        assert!(detector.severity() >= Severity::Idle);
    }

    #[test]
    fn quiet_period_forces_reset_to_idle_with_easing_signal() {
        let mut detector = CascadeDetector::new(0);
        let thresholds = CascadeThresholds::default();
        let scale = Scale::default();

        let ts = 1_700_000_000_000;
        for i in 0..20u64 {
            let _ = detector.update(liq(ts + i * 30, 0, 70_000.0, 3.0), scale, ts + i * 30, &thresholds, 1);
        }
        assert!(detector.severity() > Severity::Idle);

        let quiet_now = ts + thresholds.quiet_period.as_millis() as u64 + 1;
        let signal = detector.tick_quiet(quiet_now, &thresholds);

        assert_eq!(detector.severity(), Severity::Idle);
        assert!(signal.is_some());
        let signal = signal.unwrap();
        assert_eq!(signal.kind, SignalKind::Easing);
        assert_eq!(signal.value_usd, 0.0, "quiet-period reset has no triggering window to report notional for");
        assert_eq!(signal.value_tokens, 0.0);
    }

    #[test]
    fn tick_quiet_is_noop_when_already_idle() {
        let mut detector = CascadeDetector::new(0);
        let thresholds = CascadeThresholds::default();
        assert!(detector.tick_quiet(1_700_000_000_000, &thresholds).is_none());
    }

    #[test]
    fn cross_exchange_correlation_is_bounded_and_concentrated_when_single_venue() {
        let mut window = TimeframeWindow::new(2_000, true);
        let now = 1_700_000_000_000u64;
        for i in 0..5u64 {
            window.push(WindowEvent { ts_ms: now - i * 100, value_usd: 10_000.0, value_tokens: 1.0, exchange_id: 0 });
        }
        let (correlation, leading) = window.cross_exchange_correlation(now, 3);
        assert!((0.0..=1.0).contains(&correlation));
        assert_eq!(leading, Some(0));
    }

    #[test]
    fn single_configured_exchange_is_trivially_correlated() {
        let mut window = TimeframeWindow::new(2_000, true);
        let now = 1_700_000_000_000u64;
        window.push(WindowEvent { ts_ms: now, value_usd: 1_000.0, value_tokens: 0.5, exchange_id: 0 });
        let (correlation, _) = window.cross_exchange_correlation(now, 1);
        assert_eq!(correlation, 1.0);
    }

    #[test]
    fn normalize_caps_at_one() {
        assert_eq!(normalize(200.0, 100.0), 1.0);
        assert_eq!(normalize(50.0, 100.0), 0.5);
        assert_eq!(normalize(10.0, 0.0), 0.0);
    }
}

//! Async wrapper around [`CascadeDetector`](super::CascadeDetector): one
//! task owns every symbol's detector state and drives it off the
//! ingestor's broadcast of [`CompactLiquidation`]s.

use super::{CascadeDetector, CascadeSignal, CascadeThresholds};
use crate::model::liquidation::{CompactLiquidation, Scale};
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

const QUIET_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Emitted alongside [`CascadeSignal`]s when the actor falls behind real
/// time and has to drop buffered events to catch up.
#[derive(Clone, Debug, PartialEq)]
pub struct BackpressureDiagnostic {
    pub dropped: u64,
    pub lag_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ActorEvent {
    Signal(CascadeSignal),
    Backpressure(BackpressureDiagnostic),
}

/// Owns one [`CascadeDetector`] per symbol and feeds it from a single
/// liquidation broadcast stream, emitting [`ActorEvent`]s downstream.
pub struct CascadeActor {
    detectors: HashMap<u16, CascadeDetector>,
    thresholds: CascadeThresholds,
    scale: Scale,
    n_exchanges: usize,
    events_in: broadcast::Receiver<CompactLiquidation>,
    events_out: mpsc::Sender<ActorEvent>,
}

impl CascadeActor {
    pub fn new(
        events_in: broadcast::Receiver<CompactLiquidation>,
        events_out: mpsc::Sender<ActorEvent>,
        thresholds: CascadeThresholds,
        n_exchanges: usize,
    ) -> Self {
        Self {
            detectors: HashMap::new(),
            thresholds,
            scale: Scale::default(),
            n_exchanges,
            events_in,
            events_out,
        }
    }

    /// Drives the actor until the upstream broadcast channel closes.
    pub async fn run(mut self) {
        let mut quiet_ticker = tokio::time::interval(QUIET_TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = quiet_ticker.tick() => {
                    self.tick_all_quiet().await;
                }
                received = self.events_in.recv() => {
                    match received {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "cascade actor lagged behind the liquidation broadcast channel");
                            let diagnostic = BackpressureDiagnostic { dropped: skipped, lag_ms: 0 };
                            let _ = self.events_out.send(ActorEvent::Backpressure(diagnostic)).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: CompactLiquidation) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        let lag_ms = now_ms.saturating_sub(event.ts_ms);

        if lag_ms > self.thresholds.lag_tolerance.as_millis() as u64 {
            let dropped = self.drain_stale();
            warn!(lag_ms, dropped, "cascade actor behind real time, dropped buffered events");
            let diagnostic = BackpressureDiagnostic { dropped, lag_ms };
            let _ = self.events_out.send(ActorEvent::Backpressure(diagnostic)).await;
            return;
        }

        let detector = self
            .detectors
            .entry(event.symbol_id)
            .or_insert_with(|| CascadeDetector::new(event.symbol_id));

        if let Some(signal) = detector.update(event, self.scale, now_ms, &self.thresholds, self.n_exchanges) {
            let _ = self.events_out.send(ActorEvent::Signal(signal)).await;
        }
    }

    /// Drops every event already queued in the broadcast channel without
    /// scoring them, since they're stale by the time they'd be processed.
    /// Returns the number dropped.
    fn drain_stale(&mut self) -> u64 {
        let mut dropped = 0u64;
        loop {
            match self.events_in.try_recv() {
                Ok(_) => dropped += 1,
                Err(_) => break,
            }
        }
        dropped
    }

    async fn tick_all_quiet(&mut self) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        for detector in self.detectors.values_mut() {
            if let Some(signal) = detector.tick_quiet(now_ms, &self.thresholds) {
                let _ = self.events_out.send(ActorEvent::Signal(signal)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::liquidation::LiqSide;

    fn liq(ts_ms: u64, exchange_id: u8, price: f64, quantity: f64) -> CompactLiquidation {
        CompactLiquidation::encode(ts_ms, 1, exchange_id, LiqSide::Long, price, quantity, Scale::default(), false)
    }

    #[tokio::test]
    async fn fresh_events_produce_signals_through_the_output_channel() {
        let (tx, rx) = broadcast::channel(128);
        let (out_tx, mut out_rx) = mpsc::channel(128);
        let actor = CascadeActor::new(rx, out_tx, CascadeThresholds::default(), 1);

        let handle = tokio::spawn(actor.run());

        let now = Utc::now().timestamp_millis() as u64;
        for i in 0..30u64 {
            tx.send(liq(now + i * 10, 0, 80_000.0, 5.0)).unwrap();
        }
        drop(tx);

        let mut saw_signal = false;
        while let Some(event) = out_rx.recv().await {
            if matches!(event, ActorEvent::Signal(_)) {
                saw_signal = true;
            }
        }
        handle.await.unwrap();
        assert!(saw_signal);
    }

    #[tokio::test]
    async fn stale_events_trigger_backpressure_diagnostic_instead_of_scoring() {
        let (tx, rx) = broadcast::channel(128);
        let (out_tx, mut out_rx) = mpsc::channel(128);
        let actor = CascadeActor::new(rx, out_tx, CascadeThresholds::default(), 1);

        let handle = tokio::spawn(actor.run());

        let stale_ts = Utc::now().timestamp_millis() as u64 - 20_000;
        tx.send(liq(stale_ts, 0, 80_000.0, 5.0)).unwrap();
        drop(tx);

        let mut saw_backpressure = false;
        while let Some(event) = out_rx.recv().await {
            if matches!(event, ActorEvent::Backpressure(_)) {
                saw_backpressure = true;
            }
        }
        handle.await.unwrap();
        assert!(saw_backpressure);
    }
}

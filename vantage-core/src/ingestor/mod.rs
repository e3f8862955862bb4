//! Liquidation ingest: consumes each provider's raw liquidation stream,
//! normalizes it to [`CompactLiquidation`] and appends it to a per-symbol
//! ring buffer in arrival order.
//!
//! Reconnect-with-backoff already happens inside every [`ExchangeProvider`]
//! (`crate::provider::reconnect`), so from here a provider's stream looks
//! like a single long-lived, self-healing source. That makes literal
//! "three consecutive failed reconnects" invisible at this layer — instead
//! a watchdog task treats prolonged silence on a stream as the same signal:
//! at the provider's 30s backoff cap, three failed attempts take at least
//! 90s, so 90s of silence is used as the `DEGRADED` threshold.

use crate::error::VantageError;
use crate::model::liquidation::{CompactLiquidation, RawLiquidation, Scale};
use crate::model::symbol::{Symbol, SymbolTable};
use crate::provider::{ExchangeProvider, exchange_id};
use chrono::Utc;
use futures_util::StreamExt;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

/// Ring buffer capacity per symbol.
pub const RING_CAPACITY: usize = 1000;

/// Default minimum notional value an event must clear to be ingested.
pub const DEFAULT_FLOOR_USD: f64 = 1_000.0;

/// Exchange-reported timestamps more than this far from local clock are
/// treated as unreliable and replaced with ingest time.
const TIMESTAMP_SKEW_TOLERANCE: Duration = Duration::from_secs(5);

/// Silence on a provider's stream longer than this is reported as
/// `DEGRADED`. See module docs for why this is silence-based rather than a
/// literal reconnect-attempt counter.
const SILENCE_DEGRADED_THRESHOLD: Duration = Duration::from_secs(90);

const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_secs(15);

const EVENT_BROADCAST_CAPACITY: usize = 4096;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionHealth {
    Live,
    Degraded,
}

fn classify_silence(silent_for: Duration) -> ConnectionHealth {
    if silent_for > SILENCE_DEGRADED_THRESHOLD {
        ConnectionHealth::Degraded
    } else {
        ConnectionHealth::Live
    }
}

#[derive(Copy, Clone, Debug)]
pub struct IngestorConfig {
    /// Events below this USD notional (`price * quantity`) are dropped.
    pub floor_usd: f64,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            floor_usd: DEFAULT_FLOOR_USD,
        }
    }
}

/// Owns every symbol's liquidation ring buffer and the per-exchange health
/// signal, fed by one [`run_provider`](Self::run_provider) task per venue.
pub struct LiquidationIngestor {
    symbols: Arc<SymbolTable>,
    config: IngestorConfig,
    buffers: RwLock<IndexMap<u16, Mutex<VecDeque<CompactLiquidation>>>>,
    health: RwLock<HashMap<&'static str, watch::Sender<ConnectionHealth>>>,
    events: broadcast::Sender<CompactLiquidation>,
}

impl LiquidationIngestor {
    pub fn new(symbols: Arc<SymbolTable>) -> Self {
        Self::with_config(symbols, IngestorConfig::default())
    }

    pub fn with_config(symbols: Arc<SymbolTable>, config: IngestorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            symbols,
            config,
            buffers: RwLock::new(IndexMap::new()),
            health: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to every [`CompactLiquidation`] accepted by the floor
    /// filter, in arrival order. Used by the cascade detector.
    pub fn subscribe(&self) -> broadcast::Receiver<CompactLiquidation> {
        self.events.subscribe()
    }

    /// Current `DEGRADED`/`Live` signal for a venue, if it has ever been
    /// registered via [`run_provider`](Self::run_provider).
    pub fn health(&self, exchange: &str) -> Option<watch::Receiver<ConnectionHealth>> {
        self.health.read().get(exchange).map(|tx| tx.subscribe())
    }

    /// Snapshot of the current ring buffer for `symbol`, oldest first.
    /// Empty if the symbol has never been interned (no events ingested).
    pub fn ring_snapshot(&self, symbol: &Symbol) -> Vec<CompactLiquidation> {
        let Some(id) = self.symbols.get(symbol) else {
            return Vec::new();
        };
        self.buffers
            .read()
            .get(&id)
            .map(|ring| ring.lock().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drive one provider's liquidation stream until it ends (cancellation
    /// or the provider's internal reconnect loop giving up, which it never
    /// does by design — `ExchangeProvider::stream_liquidations` reconnects
    /// forever).
    pub async fn run_provider(
        self: Arc<Self>,
        provider: Arc<dyn ExchangeProvider>,
        symbols: Vec<Symbol>,
    ) -> Result<(), VantageError> {
        let exchange = provider.id();
        let exch_id = exchange_id(exchange);

        let (health_tx, _) = watch::channel(ConnectionHealth::Live);
        self.health.write().insert(exchange, health_tx.clone());

        let last_event_ms = Arc::new(AtomicI64::new(Utc::now().timestamp_millis()));

        let watchdog_health = health_tx.clone();
        let watchdog_last_event = last_event_ms.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let last = watchdog_last_event.load(Ordering::Relaxed);
                let silent_for_ms = (Utc::now().timestamp_millis() - last).max(0) as u64;
                let state = classify_silence(Duration::from_millis(silent_for_ms));
                if watchdog_health.send(state).is_err() {
                    return;
                }
                if state == ConnectionHealth::Degraded {
                    warn!(exchange, silent_for_ms, "liquidation stream degraded");
                }
            }
        });

        let mut stream = provider.stream_liquidations(&symbols).await?;
        info!(exchange, symbols = symbols.len(), "liquidation ingest started");

        while let Some(raw) = stream.next().await {
            last_event_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
            let _ = health_tx.send(ConnectionHealth::Live);
            self.ingest(exch_id, raw);
        }

        Ok(())
    }

    /// Floor-filter, timestamp-repair, intern and append a single raw
    /// event. Synchronous: the only side effects are the ring buffer write
    /// and the broadcast send, neither of which can block on I/O.
    fn ingest(&self, exchange_id: u8, raw: RawLiquidation) {
        let value_usd = raw.price * raw.quantity;
        if value_usd < self.config.floor_usd {
            return;
        }

        let now_ms = Utc::now().timestamp_millis() as u64;
        let (ts_ms, ts_synthetic) = if raw.ts_ms.abs_diff(now_ms) > TIMESTAMP_SKEW_TOLERANCE.as_millis() as u64 {
            (now_ms, true)
        } else {
            (raw.ts_ms, raw.ts_synthetic)
        };

        let symbol_id = self.symbols.intern(&raw.symbol);
        let compact = CompactLiquidation::encode(
            ts_ms,
            symbol_id,
            exchange_id,
            raw.side,
            raw.price,
            raw.quantity,
            Scale::default(),
            ts_synthetic,
        );

        self.push_ring(symbol_id, compact);
        let _ = self.events.send(compact);
    }

    fn push_ring(&self, symbol_id: u16, compact: CompactLiquidation) {
        if !self.buffers.read().contains_key(&symbol_id) {
            self.buffers
                .write()
                .entry(symbol_id)
                .or_insert_with(|| Mutex::new(VecDeque::with_capacity(RING_CAPACITY)));
        }

        let guard = self.buffers.read();
        let mut ring = guard.get(&symbol_id).expect("ring just inserted").lock();
        if ring.len() >= RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(compact);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::liquidation::LiqSide;

    fn raw(symbol: &str, price: f64, quantity: f64, ts_ms: u64) -> RawLiquidation {
        RawLiquidation {
            exchange: "binance",
            symbol: Symbol::new(symbol),
            side: LiqSide::Long,
            price,
            quantity,
            ts_ms,
            ts_synthetic: false,
        }
    }

    #[test]
    fn events_below_floor_are_dropped() {
        let ingestor = LiquidationIngestor::new(Arc::new(SymbolTable::new()));
        let now = Utc::now().timestamp_millis() as u64;

        ingestor.ingest(0, raw("BTC", 10.0, 1.0, now));
        assert!(ingestor.ring_snapshot(&Symbol::new("BTC")).is_empty());

        ingestor.ingest(0, raw("BTC", 60_000.0, 1.0, now));
        assert_eq!(ingestor.ring_snapshot(&Symbol::new("BTC")).len(), 1);
    }

    #[test]
    fn skewed_timestamp_is_replaced_and_flagged_synthetic() {
        let ingestor = LiquidationIngestor::new(Arc::new(SymbolTable::new()));
        let stale_ts = 0u64;

        ingestor.ingest(0, raw("ETH", 3_000.0, 10.0, stale_ts));

        let ring = ingestor.ring_snapshot(&Symbol::new("ETH"));
        assert_eq!(ring.len(), 1);
        assert!(ring[0].ts_synthetic);
        assert_ne!(ring[0].ts_ms, stale_ts);
    }

    #[test]
    fn fresh_timestamp_is_kept_as_reported() {
        let ingestor = LiquidationIngestor::new(Arc::new(SymbolTable::new()));
        let now = Utc::now().timestamp_millis() as u64;

        ingestor.ingest(0, raw("SOL", 150.0, 100.0, now));

        let ring = ingestor.ring_snapshot(&Symbol::new("SOL"));
        assert_eq!(ring.len(), 1);
        assert!(!ring[0].ts_synthetic);
        assert_eq!(ring[0].ts_ms, now);
    }

    #[test]
    fn ring_buffer_evicts_oldest_past_capacity() {
        let ingestor = LiquidationIngestor::new(Arc::new(SymbolTable::new()));
        let base = Utc::now().timestamp_millis() as u64;

        for i in 0..(RING_CAPACITY + 10) {
            ingestor.ingest(0, raw("BTC", 60_000.0, 1.0, base + i as u64));
        }

        let ring = ingestor.ring_snapshot(&Symbol::new("BTC"));
        assert_eq!(ring.len(), RING_CAPACITY);
        assert_eq!(ring.first().unwrap().ts_ms, base + 10);
        assert_eq!(ring.last().unwrap().ts_ms, base + RING_CAPACITY as u64 + 9);
    }

    #[test]
    fn silence_past_threshold_is_degraded() {
        assert_eq!(classify_silence(Duration::from_secs(10)), ConnectionHealth::Live);
        assert_eq!(classify_silence(Duration::from_secs(91)), ConnectionHealth::Degraded);
    }

    #[test]
    fn symbols_with_no_events_have_empty_ring() {
        let ingestor = LiquidationIngestor::new(Arc::new(SymbolTable::new()));
        assert!(ingestor.ring_snapshot(&Symbol::new("DOGE")).is_empty());
    }
}

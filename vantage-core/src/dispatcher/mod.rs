//! Alert dispatch: dedup, per-(symbol, kind) rate limiting, severity-then-FIFO
//! ordering and retrying delivery to a consumer-supplied sink.
//!
//! The queueing/dedup/rate-limit logic is synchronous and holds no sink
//! reference, so it's unit-tested without tokio; [`AlertDispatcher::dispatch_next`]
//! is the only async entry point, delivering through an [`AlertSink`].

use crate::error::VantageError;
use crate::model::alert::{AlertEnvelope, AlertKind, AlertPayload, DedupKey, Severity};
use crate::model::symbol::Symbol;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Default window within which a repeated, non-escalating alert is
/// suppressed.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Default per-(symbol, kind) token bucket capacity and hourly refill rate.
pub const DEFAULT_RATE_LIMIT_PER_HOUR: f64 = 10.0;

/// Delivery retry backoff schedule.
const RETRY_BACKOFF: [Duration; 3] = [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

/// Where dispatched [`AlertEnvelope`]s go. Implemented for
/// `tokio::sync::mpsc::Sender<AlertEnvelope>` for the common case; tests use
/// an in-memory mock.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, envelope: AlertEnvelope) -> Result<(), VantageError>;
}

#[async_trait]
impl AlertSink for mpsc::Sender<AlertEnvelope> {
    async fn send(&self, envelope: AlertEnvelope) -> Result<(), VantageError> {
        self.send(envelope).await.map_err(|_| VantageError::Socket("alert sink closed".to_string()))
    }
}

/// Fan-out to every subscribed consumer, in the shape of the teacher's
/// `barter-data-server` broadcast loop. A broadcast send only errors when
/// there are zero subscribers, which isn't a delivery failure worth
/// retrying, so it's always reported `Ok`.
#[async_trait]
impl AlertSink for tokio::sync::broadcast::Sender<AlertEnvelope> {
    async fn send(&self, envelope: AlertEnvelope) -> Result<(), VantageError> {
        let _ = tokio::sync::broadcast::Sender::send(self, envelope);
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
struct DedupEntry {
    severity: Severity,
    last_seen: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn new(now: DateTime<Utc>, capacity: f64) -> Self {
        Self { tokens: capacity, last_refill: now }
    }

    fn try_take(&mut self, now: DateTime<Utc>, capacity: f64, refill_per_hour: f64) -> bool {
        let elapsed_hours = (now - self.last_refill).num_milliseconds().max(0) as f64 / 3_600_000.0;
        self.tokens = (self.tokens + elapsed_hours * refill_per_hour).min(capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Max-heap ordering: higher severity pops first; within equal severity,
/// the earlier timestamp pops first (FIFO).
#[derive(Clone, Debug)]
struct QueuedAlert(AlertEnvelope);

impl PartialEq for QueuedAlert {
    fn eq(&self, other: &Self) -> bool {
        self.0.severity == other.0.severity && self.0.ts == other.0.ts
    }
}
impl Eq for QueuedAlert {}

impl Ord for QueuedAlert {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.severity.cmp(&other.0.severity).then_with(|| other.0.ts.cmp(&self.0.ts))
    }
}
impl PartialOrd for QueuedAlert {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    dedup: Mutex<HashMap<DedupKey, DedupEntry>>,
    dedup_window: ChronoDuration,
    buckets: Mutex<HashMap<(Symbol, AlertKind), TokenBucket>>,
    rate_limit_per_hour: f64,
    queue: Mutex<BinaryHeap<QueuedAlert>>,
    dropped_rate_limited: AtomicU64,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            sink,
            dedup: Mutex::new(HashMap::new()),
            dedup_window: ChronoDuration::from_std(DEFAULT_DEDUP_WINDOW).expect("valid duration"),
            buckets: Mutex::new(HashMap::new()),
            rate_limit_per_hour: DEFAULT_RATE_LIMIT_PER_HOUR,
            queue: Mutex::new(BinaryHeap::new()),
            dropped_rate_limited: AtomicU64::new(0),
        }
    }

    pub fn dropped_rate_limited_count(&self) -> u64 {
        self.dropped_rate_limited.load(AtomicOrdering::Relaxed)
    }

    /// Runs dedup and rate-limit checks and, if the alert survives both,
    /// pushes it onto the priority queue. Returns whether it was accepted.
    pub fn enqueue(&self, envelope: AlertEnvelope, now: DateTime<Utc>) -> bool {
        if !self.passes_dedup(&envelope, now) {
            return false;
        }
        if !self.passes_rate_limit(&envelope, now) {
            self.dropped_rate_limited.fetch_add(1, AtomicOrdering::Relaxed);
            return false;
        }

        self.queue.lock().push(QueuedAlert(envelope));
        true
    }

    /// Severity-aware dedup: a repeat within the window is suppressed
    /// unless it escalates the severity already recorded for that key.
    fn passes_dedup(&self, envelope: &AlertEnvelope, now: DateTime<Utc>) -> bool {
        let key = envelope.dedup_key();
        let mut dedup = self.dedup.lock();

        match dedup.get(&key) {
            Some(entry) if now - entry.last_seen < self.dedup_window && envelope.severity <= entry.severity => false,
            _ => {
                dedup.insert(key, DedupEntry { severity: envelope.severity, last_seen: now });
                true
            }
        }
    }

    fn passes_rate_limit(&self, envelope: &AlertEnvelope, now: DateTime<Utc>) -> bool {
        let key = (envelope.symbol.clone(), envelope.kind.clone());
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(|| TokenBucket::new(now, self.rate_limit_per_hour));
        bucket.try_take(now, self.rate_limit_per_hour, self.rate_limit_per_hour)
    }

    /// Drops dedup entries whose window has fully elapsed, bounding the
    /// map's size under sustained load.
    pub fn prune_dedup(&self, now: DateTime<Utc>) {
        self.dedup.lock().retain(|_, entry| now - entry.last_seen < self.dedup_window);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Pops the highest-priority queued alert and delivers it, retrying
    /// with backoff on failure. Returns `false` when the queue is empty.
    pub async fn dispatch_next(&self) -> bool {
        let Some(QueuedAlert(envelope)) = self.queue.lock().pop() else {
            return false;
        };
        self.deliver_with_retry(envelope).await;
        true
    }

    async fn deliver_with_retry(&self, envelope: AlertEnvelope) {
        let mut last_error = None;
        if self.sink.send(envelope.clone()).await.is_ok() {
            return;
        }

        for delay in RETRY_BACKOFF {
            tokio::time::sleep(delay).await;
            match self.sink.send(envelope.clone()).await {
                Ok(()) => return,
                Err(error) => last_error = Some(error),
            }
        }

        warn!(symbol = %envelope.symbol, kind = ?envelope.kind, "alert delivery failed after retries, dropping");
        let diagnostic = AlertEnvelope {
            kind: AlertKind::DeliveryFailed,
            symbol: envelope.symbol.clone(),
            severity: envelope.severity,
            ts: Utc::now(),
            payload: AlertPayload::Diagnostic {
                message: last_error.map(|e| e.to_string()).unwrap_or_else(|| "delivery failed".to_string()),
            },
        };
        let _ = self.sink.send(diagnostic).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        received: AsyncMutex<Vec<AlertEnvelope>>,
        fail_until: AtomicU64,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { received: AsyncMutex::new(Vec::new()), fail_until: AtomicU64::new(0) }
        }

        fn failing(attempts: u64) -> Self {
            Self { received: AsyncMutex::new(Vec::new()), fail_until: AtomicU64::new(attempts) }
        }

        async fn len(&self) -> usize {
            self.received.lock().await.len()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, envelope: AlertEnvelope) -> Result<(), VantageError> {
            if self.fail_until.load(AtomicOrdering::Relaxed) > 0 {
                self.fail_until.fetch_sub(1, AtomicOrdering::Relaxed);
                return Err(VantageError::Socket("simulated failure".to_string()));
            }
            self.received.lock().await.push(envelope);
            Ok(())
        }
    }

    fn cascade_envelope(symbol: &str, severity: Severity, ts: DateTime<Utc>) -> AlertEnvelope {
        AlertEnvelope {
            kind: AlertKind::CascadeAlert,
            symbol: Symbol::new(symbol),
            severity,
            ts,
            payload: AlertPayload::Cascade { probability: 0.6, leading_exchange: None, value_usd: 10_000.0, value_tokens: 1.0 },
        }
    }

    #[test]
    fn repeat_alert_within_window_is_deduped() {
        let dispatcher = AlertDispatcher::new(Arc::new(mpsc::channel(8).0));
        let now = Utc::now();

        assert!(dispatcher.enqueue(cascade_envelope("BTC", Severity::Med, now), now));
        assert!(!dispatcher.enqueue(cascade_envelope("BTC", Severity::Med, now + ChronoDuration::seconds(1)), now + ChronoDuration::seconds(1)));
    }

    #[test]
    fn severity_escalation_bypasses_dedup() {
        let dispatcher = AlertDispatcher::new(Arc::new(mpsc::channel(8).0));
        let now = Utc::now();

        assert!(dispatcher.enqueue(cascade_envelope("BTC", Severity::Med, now), now));
        assert!(dispatcher.enqueue(cascade_envelope("BTC", Severity::Critical, now + ChronoDuration::seconds(1)), now + ChronoDuration::seconds(1)));
    }

    #[test]
    fn dedup_expires_after_the_window_elapses() {
        let dispatcher = AlertDispatcher::new(Arc::new(mpsc::channel(8).0));
        let now = Utc::now();

        assert!(dispatcher.enqueue(cascade_envelope("ETH", Severity::Low, now), now));
        let later = now + ChronoDuration::from_std(DEFAULT_DEDUP_WINDOW).unwrap() + ChronoDuration::seconds(1);
        assert!(dispatcher.enqueue(cascade_envelope("ETH", Severity::Low, later), later));
    }

    #[test]
    fn rate_limit_drops_overflow_without_queueing() {
        let dispatcher = AlertDispatcher::new(Arc::new(mpsc::channel(8).0));
        let now = Utc::now();

        for i in 0..(DEFAULT_RATE_LIMIT_PER_HOUR as i64) {
            let ts = now + ChronoDuration::milliseconds(i);
            assert!(dispatcher.enqueue(cascade_envelope(&format!("SYM{i}"), Severity::High, ts), ts), "distinct symbols should each get a fresh dedup key");
        }

        // Same symbol hammered past its bucket capacity.
        let mut accepted = 0;
        for i in 0..20 {
            let ts = now + ChronoDuration::milliseconds(i);
            if dispatcher.enqueue(cascade_envelope("DOGE", Severity::High, ts), ts) {
                accepted += 1;
            }
        }
        assert!(accepted <= DEFAULT_RATE_LIMIT_PER_HOUR as i32);
        assert!(dispatcher.dropped_rate_limited_count() > 0);
    }

    #[test]
    fn queue_pops_highest_severity_first_then_fifo() {
        let dispatcher = AlertDispatcher::new(Arc::new(mpsc::channel(8).0));
        let now = Utc::now();

        dispatcher.enqueue(cascade_envelope("AAA", Severity::Low, now), now);
        dispatcher.enqueue(cascade_envelope("BBB", Severity::Critical, now + ChronoDuration::seconds(1)), now + ChronoDuration::seconds(1));
        dispatcher.enqueue(cascade_envelope("CCC", Severity::Critical, now + ChronoDuration::seconds(2)), now + ChronoDuration::seconds(2));

        let mut queue = dispatcher.queue.lock();
        let first = queue.pop().unwrap().0;
        let second = queue.pop().unwrap().0;
        let third = queue.pop().unwrap().0;

        assert_eq!(first.symbol, Symbol::new("BBB"));
        assert_eq!(second.symbol, Symbol::new("CCC"));
        assert_eq!(third.symbol, Symbol::new("AAA"));
    }

    #[tokio::test]
    async fn dispatch_next_delivers_through_the_sink() {
        let sink = Arc::new(RecordingSink::new());
        let dispatcher = AlertDispatcher::new(sink.clone());
        let now = Utc::now();

        dispatcher.enqueue(cascade_envelope("BTC", Severity::High, now), now);
        assert!(dispatcher.dispatch_next().await);
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn dispatch_next_on_empty_queue_returns_false() {
        let dispatcher = AlertDispatcher::new(Arc::new(mpsc::channel(8).0));
        assert!(!dispatcher.dispatch_next().await);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_a_delivery_failed_diagnostic() {
        let sink = Arc::new(RecordingSink::failing(10));
        let dispatcher = AlertDispatcher::new(sink.clone());
        let now = Utc::now();

        dispatcher.enqueue(cascade_envelope("BTC", Severity::Critical, now), now);
        dispatcher.dispatch_next().await;

        // All attempts (including the diagnostic) failed, so nothing landed.
        assert_eq!(sink.len().await, 0);
    }

    #[tokio::test]
    async fn recovers_within_the_retry_budget() {
        let sink = Arc::new(RecordingSink::failing(2));
        let dispatcher = AlertDispatcher::new(sink.clone());
        let now = Utc::now();

        dispatcher.enqueue(cascade_envelope("BTC", Severity::Critical, now), now);
        dispatcher.dispatch_next().await;

        assert_eq!(sink.len().await, 1);
    }
}

//! Multi-exchange OI fan-out: one concurrent, deadline-bounded task per
//! configured provider, folded into a single [`ValidatedOISnapshot`].

use crate::error::VantageError;
use crate::model::market::{ExchangeError, ExchangeOIResult, ValidatedOISnapshot, ValidationStatus};
use crate::model::symbol::Symbol;
use crate::provider::{ExchangeProvider, SNAPSHOT_DEADLINE};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const ERROR_WINDOW: Duration = Duration::from_secs(60);

/// Default share of total OI above which a single exchange triggers
/// `EXCHANGE_DOMINANCE`.
pub const DEFAULT_DOMINANCE_SHARE_THRESHOLD: f64 = 0.40;

/// Default relative spread above which two exchanges' totals trigger
/// `CROSS_EXCHANGE_SKEW`.
pub const DEFAULT_SKEW_PCT_THRESHOLD: f64 = 0.25;

/// Fans a `snapshot(symbol)` call out across every configured provider and
/// folds the results into a [`ValidatedOISnapshot`].
///
/// A provider's own `snapshot` impl already retries transient failures
/// internally; the aggregator only imposes the outer, shared deadline and
/// turns a missing/failed/cancelled provider into a `FAILED`
/// [`ExchangeOIResult`] rather than aborting the whole aggregate.
pub struct OiAggregator {
    providers: Vec<Arc<dyn ExchangeProvider>>,
    deadline: Duration,
    dominance_share_threshold: f64,
    skew_pct_threshold: f64,
    recent_errors: Mutex<VecDeque<DateTime<Utc>>>,
}

impl OiAggregator {
    pub fn new(providers: Vec<Arc<dyn ExchangeProvider>>) -> Self {
        Self {
            providers,
            deadline: SNAPSHOT_DEADLINE,
            dominance_share_threshold: DEFAULT_DOMINANCE_SHARE_THRESHOLD,
            skew_pct_threshold: DEFAULT_SKEW_PCT_THRESHOLD,
            recent_errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Count of provider-snapshot failures in the trailing minute, surfaced
    /// on the health endpoint. Prunes entries older than the window as a
    /// side effect.
    pub fn errors_last_minute(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(ERROR_WINDOW).expect("valid duration");
        let mut errors = self.recent_errors.lock();
        while errors.front().is_some_and(|ts| *ts < cutoff) {
            errors.pop_front();
        }
        errors.len()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_thresholds(mut self, dominance_share_threshold: f64, skew_pct_threshold: f64) -> Self {
        self.dominance_share_threshold = dominance_share_threshold;
        self.skew_pct_threshold = skew_pct_threshold;
        self
    }

    pub async fn aggregate(&self, symbol: &Symbol) -> ValidatedOISnapshot {
        let tasks = self.providers.iter().map(|provider| {
            let provider = provider.clone();
            let symbol = symbol.clone();
            let deadline = self.deadline;
            tokio::spawn(async move { fetch_one(provider, symbol, deadline).await })
        });

        let results: Vec<ExchangeOIResult> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|join_err| {
                    warn!(error = %join_err, "provider snapshot task panicked or was cancelled");
                    failed_result("unknown", VantageError::Socket(join_err.to_string()))
                })
            })
            .collect();

        let failures = results.iter().filter(|r| r.validation_status == ValidationStatus::Failed).count();
        if failures > 0 {
            let now = Utc::now();
            let mut errors = self.recent_errors.lock();
            errors.extend(std::iter::repeat(now).take(failures));
        }

        ValidatedOISnapshot::build(
            symbol.clone(),
            results,
            Utc::now(),
            self.dominance_share_threshold,
            self.skew_pct_threshold,
        )
    }
}

async fn fetch_one(provider: Arc<dyn ExchangeProvider>, symbol: Symbol, deadline: Duration) -> ExchangeOIResult {
    let exchange = provider.id();
    match tokio::time::timeout(deadline, provider.snapshot(&symbol)).await {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => {
            warn!(exchange, %error, "provider snapshot failed");
            failed_result(exchange, error)
        }
        Err(_) => {
            warn!(exchange, "provider snapshot exceeded aggregate deadline");
            failed_result(exchange, VantageError::Timeout { exchange: exchange.to_string() })
        }
    }
}

fn failed_result(exchange: &str, error: VantageError) -> ExchangeOIResult {
    ExchangeOIResult {
        exchange: exchange.to_string(),
        markets: vec![],
        total_oi_usd: 0.0,
        validation_status: ValidationStatus::Failed,
        errors: vec![ExchangeError {
            market_type: None,
            reason_code: error.reason_code().to_string(),
            message: error.to_string(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::candle::Candle;
    use crate::model::liquidation::RawLiquidation;
    use crate::model::market::{MarketOI, MarketType};
    use async_trait::async_trait;
    use futures::stream::BoxStream;

    enum Behavior {
        Ok(f64),
        Err,
        Hang,
    }

    struct MockProvider {
        name: &'static str,
        behavior: Behavior,
    }

    #[async_trait]
    impl ExchangeProvider for MockProvider {
        fn id(&self) -> &'static str {
            self.name
        }

        async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError> {
            match self.behavior {
                Behavior::Ok(oi_usd) => Ok(ExchangeOIResult {
                    exchange: self.name.to_string(),
                    markets: vec![MarketOI {
                        exchange: self.name.to_string(),
                        symbol: symbol.clone(),
                        market_type: MarketType::UsdtLinear,
                        oi_tokens: oi_usd / 50_000.0,
                        oi_usd,
                        price: 50_000.0,
                        funding_rate: 0.0001,
                        volume_24h_tokens: 1_000.0,
                        captured_at: Utc::now(),
                    }],
                    total_oi_usd: oi_usd,
                    validation_status: ValidationStatus::Ok,
                    errors: vec![],
                }),
                Behavior::Err => Err(VantageError::UnknownSymbol {
                    exchange: self.name.to_string(),
                    symbol: symbol.clone(),
                }),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("test deadline should fire first")
                }
            }
        }

        async fn stream_liquidations(
            &self,
            _symbols: &[Symbol],
        ) -> Result<BoxStream<'static, RawLiquidation>, VantageError> {
            unimplemented!("not exercised by aggregator tests")
        }

        async fn fetch_candles(&self, _symbol: &Symbol, _interval: &str, _limit: usize) -> Result<Vec<Candle>, VantageError> {
            unimplemented!("not exercised by aggregator tests")
        }

        async fn list_markets(&self, _symbol: &Symbol) -> Result<Vec<MarketType>, VantageError> {
            unimplemented!("not exercised by aggregator tests")
        }
    }

    #[tokio::test]
    async fn aggregates_across_healthy_providers() {
        let providers: Vec<Arc<dyn ExchangeProvider>> = vec![
            Arc::new(MockProvider { name: "binance", behavior: Behavior::Ok(100.0) }),
            Arc::new(MockProvider { name: "bybit", behavior: Behavior::Ok(50.0) }),
        ];
        let aggregator = OiAggregator::new(providers);

        let snapshot = aggregator.aggregate(&Symbol::new("BTC")).await;

        assert_eq!(snapshot.exchange_count, 2);
        assert!((snapshot.totals.grand_total() - 150.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn failed_provider_does_not_abort_the_aggregate() {
        let providers: Vec<Arc<dyn ExchangeProvider>> = vec![
            Arc::new(MockProvider { name: "binance", behavior: Behavior::Ok(100.0) }),
            Arc::new(MockProvider { name: "okx", behavior: Behavior::Err }),
        ];
        let aggregator = OiAggregator::new(providers);

        let snapshot = aggregator.aggregate(&Symbol::new("BTC")).await;

        assert_eq!(snapshot.exchange_count, 1);
        assert_eq!(snapshot.error_summary.len(), 1);
        assert!(snapshot.error_summary[0].contains("UNKNOWN_SYMBOL"));
        assert_eq!(aggregator.errors_last_minute(), 1);
    }

    #[tokio::test]
    async fn healthy_aggregate_does_not_bump_the_error_window() {
        let providers: Vec<Arc<dyn ExchangeProvider>> =
            vec![Arc::new(MockProvider { name: "binance", behavior: Behavior::Ok(100.0) })];
        let aggregator = OiAggregator::new(providers);

        aggregator.aggregate(&Symbol::new("BTC")).await;

        assert_eq!(aggregator.errors_last_minute(), 0);
    }

    #[tokio::test]
    async fn slow_provider_is_cancelled_at_the_shared_deadline() {
        let providers: Vec<Arc<dyn ExchangeProvider>> = vec![
            Arc::new(MockProvider { name: "binance", behavior: Behavior::Ok(100.0) }),
            Arc::new(MockProvider { name: "bitget", behavior: Behavior::Hang }),
        ];
        let aggregator = OiAggregator::new(providers).with_deadline(Duration::from_millis(50));

        let snapshot = aggregator.aggregate(&Symbol::new("BTC")).await;

        assert_eq!(snapshot.exchange_count, 1);
        assert!(snapshot.error_summary.iter().any(|e| e.contains("TIMEOUT")));
    }

    #[tokio::test]
    async fn all_providers_failing_yields_zero_count_not_an_error() {
        let providers: Vec<Arc<dyn ExchangeProvider>> =
            vec![Arc::new(MockProvider { name: "binance", behavior: Behavior::Err })];
        let aggregator = OiAggregator::new(providers);

        let snapshot = aggregator.aggregate(&Symbol::new("DOGE")).await;

        assert_eq!(snapshot.exchange_count, 0);
        assert_eq!(snapshot.totals.grand_total(), 0.0);
    }
}

//! Per-exchange adapters behind a common contract.
//!
//! Six exchanges are required: [`binance`], [`bybit`], [`okx`], [`gateio`],
//! [`bitget`], [`hyperliquid`]. Adding a new venue means adding a module
//! implementing [`ExchangeProvider`] here and registering it in the
//! aggregator/ingestor's provider set — nothing else in the core needs to
//! change.

pub mod binance;
pub mod bitget;
pub mod bybit;
pub mod gateio;
pub mod hyperliquid;
pub mod okx;

use crate::error::VantageError;
use crate::model::candle::Candle;
use crate::model::liquidation::RawLiquidation;
use crate::model::market::{ExchangeOIResult, MarketType};
use crate::model::symbol::Symbol;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// Default per-call deadline for [`ExchangeProvider::snapshot`] and
/// [`ExchangeProvider::fetch_candles`].
pub const SNAPSHOT_DEADLINE: Duration = Duration::from_secs(5);
pub const CANDLE_FETCH_DEADLINE: Duration = Duration::from_secs(8);
pub const WS_CONNECT_DEADLINE: Duration = Duration::from_secs(10);

/// Stable per-venue identifiers used as [`CompactLiquidation`](crate::model::liquidation::CompactLiquidation)'s
/// `exchange_id` byte. Order is fixed — never reassign these once a consumer
/// depends on the encoding.
pub const EXCHANGE_ID_BINANCE: u8 = 0;
pub const EXCHANGE_ID_BYBIT: u8 = 1;
pub const EXCHANGE_ID_OKX: u8 = 2;
pub const EXCHANGE_ID_GATEIO: u8 = 3;
pub const EXCHANGE_ID_BITGET: u8 = 4;
pub const EXCHANGE_ID_HYPERLIQUID: u8 = 5;

/// Map a provider's [`ExchangeProvider::id`] to its `exchange_id` byte.
pub fn exchange_id(name: &str) -> u8 {
    match name {
        "binance" => EXCHANGE_ID_BINANCE,
        "bybit" => EXCHANGE_ID_BYBIT,
        "okx" => EXCHANGE_ID_OKX,
        "gateio" => EXCHANGE_ID_GATEIO,
        "bitget" => EXCHANGE_ID_BITGET,
        "hyperliquid" => EXCHANGE_ID_HYPERLIQUID,
        other => panic!("unregistered exchange id for provider {other}"),
    }
}

/// The only coupling between the core and a venue's wire protocol.
///
/// Implementors own their own symbol formatting and are solely responsible
/// for inverse-contract arithmetic (contract multiplier, face value) — the
/// aggregator never second-guesses a provider's `oi_usd` figure, it only
/// validates that it is non-negative, non-`NaN`, and internally consistent
/// with the linear invariant where applicable.
#[async_trait]
pub trait ExchangeProvider: Send + Sync {
    /// Stable lowercase identifier used in logs, error messages, and the
    /// `exchange` field of every emitted record.
    fn id(&self) -> &'static str;

    /// Concurrent-safe, bounded-latency open-interest snapshot for `symbol`
    /// across every market-type this venue lists it under.
    ///
    /// Implementations retry transient failures internally at most twice
    /// with exponential backoff, honoring [`SNAPSHOT_DEADLINE`] overall.
    async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError>;

    /// Long-lived liquidation stream for the given symbols, reconnecting
    /// internally with exponential backoff capped at 30s.
    /// Ends only when the returned stream is dropped (cancellation).
    async fn stream_liquidations(
        &self,
        symbols: &[Symbol],
    ) -> Result<BoxStream<'static, RawLiquidation>, VantageError>;

    /// Candle history for `symbol` at `interval` (e.g. `"1h"`), most recent
    /// `limit` candles, oldest first.
    async fn fetch_candles(
        &self,
        symbol: &Symbol,
        interval: &str,
        limit: usize,
    ) -> Result<Vec<Candle>, VantageError>;

    /// Market-types this venue lists `symbol` under. Static or cached —
    /// implementations are not required to hit the network every call.
    async fn list_markets(&self, symbol: &Symbol) -> Result<Vec<MarketType>, VantageError>;
}

/// Shared helper: parse an exchange's stringly-typed JSON numeric field,
/// rejecting `NaN` and negative values — a provider must never surface
/// those as open interest.
pub(crate) fn parse_nonneg_f64(raw: &str, exchange: &'static str, field: &'static str) -> Result<f64, VantageError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| VantageError::MalformedResponse {
            exchange: exchange.to_string(),
            message: format!("field {field} is not a number: {raw:?}"),
        })?;

    if value.is_nan() || value < 0.0 {
        return Err(VantageError::MalformedResponse {
            exchange: exchange.to_string(),
            message: format!("field {field} is NaN or negative: {value}"),
        });
    }

    Ok(value)
}

pub(crate) fn parse_positive_f64(raw: &str, exchange: &'static str, field: &'static str) -> Result<f64, VantageError> {
    let value = parse_nonneg_f64(raw, exchange, field)?;
    if value <= 0.0 {
        return Err(VantageError::MalformedResponse {
            exchange: exchange.to_string(),
            message: format!("field {field} must be positive: {value}"),
        });
    }
    Ok(value)
}

/// Reconnect-with-backoff loop shared by every provider's websocket stream.
pub(crate) mod reconnect {
    use crate::error::VantageError;
    use std::future::Future;
    use std::time::Duration;
    use tracing::warn;

    const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    /// Runs `connect` in a loop, doubling the delay between attempts up to
    /// [`MAX_BACKOFF`] and resetting it after any connection that stayed up
    /// long enough to be considered healthy. Returns only when `connect`
    /// itself returns `Ok(())`, which providers use to mean "receiver
    /// dropped, stop trying".
    pub(crate) async fn run_with_backoff<F, Fut>(exchange: &'static str, mut connect: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), VantageError>>,
    {
        let mut backoff = INITIAL_BACKOFF;
        let mut consecutive_failures: u32 = 0;

        loop {
            let attempt_started = tokio::time::Instant::now();
            match connect().await {
                Ok(()) => return,
                Err(error) => {
                    consecutive_failures += 1;
                    if attempt_started.elapsed() > Duration::from_secs(60) {
                        backoff = INITIAL_BACKOFF;
                        consecutive_failures = 0;
                    }
                    warn!(
                        exchange,
                        %error,
                        consecutive_failures,
                        backoff_s = backoff.as_secs(),
                        "liquidation stream disconnected, reconnecting"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_oi() {
        let result = parse_nonneg_f64("-1.0", "binance", "oi_tokens");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_nan() {
        let result = parse_nonneg_f64("NaN", "binance", "oi_tokens");
        assert!(result.is_err());
    }

    #[test]
    fn rejects_non_positive_price() {
        assert!(parse_positive_f64("0", "binance", "price").is_err());
        assert!(parse_positive_f64("-5", "binance", "price").is_err());
    }

    #[test]
    fn accepts_well_formed_values() {
        assert!((parse_nonneg_f64("123.45", "binance", "oi_tokens").unwrap() - 123.45).abs() < 1e-9);
    }
}

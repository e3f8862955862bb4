//! Bybit v5 unified: linear (USDT/USDC) + inverse (USD-margined) perpetuals.
//!
//! Docs:
//! - OI: <https://bybit-exchange.github.io/docs/v5/market/open-interest>
//! - Tickers: <https://bybit-exchange.github.io/docs/v5/market/tickers>
//! - Liquidation stream: <https://bybit-exchange.github.io/docs/v5/websocket/public/liquidation>

use crate::de::de_str;
use crate::error::VantageError;
use crate::model::candle::Candle;
use crate::model::liquidation::{LiqSide, RawLiquidation};
use crate::model::market::{ExchangeError, ExchangeOIResult, MarketOI, MarketType, ValidationStatus};
use crate::model::symbol::Symbol;
use crate::provider::{CANDLE_FETCH_DEADLINE, ExchangeProvider, SNAPSHOT_DEADLINE, reconnect};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

const REST_BASE: &str = "https://api.bybit.com";
const WS_PUBLIC_BASE: &str = "wss://stream.bybit.com/v5/public";

/// Bybit's inverse contracts are USD-denominated face value per contract;
/// unlike COIN-M, the `openInterest` field on `/v5/market/tickers` for an
/// inverse category symbol is already expressed in USD, not contracts, so no
/// separate multiplier is needed (unlike Binance COIN-M). This is the
/// resolution of the provider's "populated inverse market must never report
/// zero USD OI" requirement: `oi_usd` is read directly off the wire rather
/// than derived from a contract count that could be mis-scaled.
fn category_for(market_type: MarketType) -> &'static str {
    match market_type {
        MarketType::UsdtLinear | MarketType::UsdcLinear => "linear",
        MarketType::UsdInverse => "inverse",
        MarketType::Native => unreachable!("bybit has no native market type"),
    }
}

/// Turns a contract count off `/v5/market/open-interest` into USD notional.
/// Inverse contracts are already USD face value, so they pass through
/// unscaled; every other market type is contract-count × last price.
/// Pulled out of `market_oi` as a pure function so the inverse branch is
/// unit-testable without a live HTTP round trip.
fn oi_usd_from_contracts(market_type: MarketType, open_interest: f64, last_price: f64) -> Result<f64, VantageError> {
    if open_interest.is_nan() || open_interest < 0.0 {
        return Err(VantageError::MalformedResponse {
            exchange: "bybit".to_string(),
            message: "negative or NaN open interest".to_string(),
        });
    }

    Ok(match market_type {
        MarketType::UsdInverse => open_interest,
        _ => open_interest * last_price,
    })
}

pub struct Bybit {
    client: reqwest::Client,
}

impl Default for Bybit {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct RestEnvelope<T> {
    #[serde(rename = "retCode")]
    ret_code: i32,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Deserialize)]
struct OiResult {
    list: Vec<OiEntry>,
}

#[derive(Deserialize)]
struct OiEntry {
    #[serde(rename = "openInterest", deserialize_with = "de_str")]
    open_interest: f64,
}

#[derive(Deserialize)]
struct TickerResult {
    list: Vec<TickerEntry>,
}

#[derive(Deserialize)]
struct TickerEntry {
    #[serde(rename = "lastPrice", deserialize_with = "de_str")]
    last_price: f64,
    #[serde(rename = "fundingRate", default, deserialize_with = "crate::de::de_opt_str_f64")]
    funding_rate: Option<f64>,
    #[serde(rename = "openInterestValue", default, deserialize_with = "crate::de::de_opt_str_f64")]
    open_interest_value: Option<f64>,
    #[serde(rename = "volume24h", deserialize_with = "de_str")]
    volume_24h: f64,
}

#[derive(Deserialize)]
struct WsEnvelope {
    topic: Option<String>,
    data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct LiquidationData {
    symbol: String,
    side: String,
    #[serde(deserialize_with = "de_str")]
    price: f64,
    size: SizeField,
    #[serde(rename = "updatedTime")]
    updated_time_ms: u64,
}

/// Bybit's liquidation `size` field is documented as a string but some
/// symbols have historically sent a bare number; accept either.
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeField {
    Str(String),
    Num(f64),
}

impl SizeField {
    fn as_f64(&self) -> Option<f64> {
        match self {
            SizeField::Str(s) => s.parse().ok(),
            SizeField::Num(n) => Some(*n),
        }
    }
}

impl Bybit {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, VantageError> {
        let resp = tokio::time::timeout(SNAPSHOT_DEADLINE, self.client.get(url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "bybit".to_string(),
            })??
            .error_for_status()?;

        let envelope: RestEnvelope<T> = resp.json().await?;
        if envelope.ret_code != 0 {
            return Err(VantageError::MalformedResponse {
                exchange: "bybit".to_string(),
                message: format!("retCode {}: {}", envelope.ret_code, envelope.ret_msg),
            });
        }
        envelope.result.ok_or_else(|| VantageError::MalformedResponse {
            exchange: "bybit".to_string(),
            message: "missing result field".to_string(),
        })
    }

    async fn market_oi(&self, symbol: &Symbol, market_type: MarketType, pair: &str) -> Result<MarketOI, VantageError> {
        let category = category_for(market_type);

        let ticker: TickerResult = self
            .get_json(&format!("{REST_BASE}/v5/market/tickers?category={category}&symbol={pair}"))
            .await?;
        let ticker_entry = ticker
            .list
            .into_iter()
            .next()
            .ok_or_else(|| VantageError::UnknownSymbol {
                exchange: "bybit".to_string(),
                symbol: symbol.clone(),
            })?;

        if ticker_entry.last_price <= 0.0 {
            return Err(VantageError::MalformedResponse {
                exchange: "bybit".to_string(),
                message: "non-positive last price".to_string(),
            });
        }

        let oi_usd = match (market_type, ticker_entry.open_interest_value) {
            (MarketType::UsdInverse, Some(value)) if value > 0.0 => value,
            _ => {
                let oi: OiResult = self
                    .get_json(&format!(
                        "{REST_BASE}/v5/market/open-interest?category={category}&symbol={pair}&intervalTime=5min"
                    ))
                    .await?;
                let oi_entry = oi.list.into_iter().next().ok_or_else(|| VantageError::MalformedResponse {
                    exchange: "bybit".to_string(),
                    message: "empty open-interest list".to_string(),
                })?;
                oi_usd_from_contracts(market_type, oi_entry.open_interest, ticker_entry.last_price)?
            }
        };

        if oi_usd <= 0.0 {
            return Err(VantageError::MalformedResponse {
                exchange: "bybit".to_string(),
                message: "resolved zero or negative USD open interest for a populated market".to_string(),
            });
        }

        let oi_tokens = oi_usd / ticker_entry.last_price;

        Ok(MarketOI {
            exchange: "bybit".to_string(),
            symbol: symbol.clone(),
            market_type,
            oi_tokens,
            oi_usd,
            price: ticker_entry.last_price,
            funding_rate: ticker_entry.funding_rate.unwrap_or(0.0),
            volume_24h_tokens: ticker_entry.volume_24h,
            captured_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeProvider for Bybit {
    fn id(&self) -> &'static str {
        "bybit"
    }

    async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError> {
        let base = symbol.as_str();
        let candidates = [
            (MarketType::UsdtLinear, format!("{base}USDT")),
            (MarketType::UsdcLinear, format!("{base}PERP")),
            (MarketType::UsdInverse, format!("{base}USD")),
        ];

        let mut markets = Vec::new();
        let mut errors = Vec::new();

        for (market_type, pair) in candidates {
            match self.market_oi(symbol, market_type, &pair).await {
                Ok(m) => markets.push(m),
                Err(e) => {
                    warn!(exchange = "bybit", ?market_type, error = %e, "provider call failed");
                    errors.push(ExchangeError {
                        market_type: Some(market_type),
                        reason_code: e.reason_code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let total_oi_usd = markets.iter().map(|m| m.oi_usd).sum();
        let validation_status = match (markets.len(), errors.len()) {
            (0, _) => ValidationStatus::Failed,
            (_, 0) => ValidationStatus::Ok,
            _ => ValidationStatus::Partial,
        };

        Ok(ExchangeOIResult {
            exchange: "bybit".to_string(),
            markets,
            total_oi_usd,
            validation_status,
            errors,
        })
    }

    async fn stream_liquidations(
        &self,
        symbols: &[Symbol],
    ) -> Result<BoxStream<'static, RawLiquidation>, VantageError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let symbols: Vec<Symbol> = symbols.to_vec();

        tokio::spawn(async move {
            reconnect::run_with_backoff("bybit", move || {
                let tx = tx.clone();
                let symbols = symbols.clone();
                async move { run_liquidation_stream(symbols, tx).await }
            })
            .await;
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_candles(&self, symbol: &Symbol, interval: &str, limit: usize) -> Result<Vec<Candle>, VantageError> {
        let pair = format!("{}USDT", symbol.as_str());
        let url = format!(
            "{REST_BASE}/v5/market/kline?category=linear&symbol={pair}&interval={}&limit={limit}",
            bybit_interval(interval)
        );

        let resp = tokio::time::timeout(CANDLE_FETCH_DEADLINE, self.client.get(&url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "bybit".to_string(),
            })??
            .error_for_status()?;

        #[derive(Deserialize)]
        struct KlineResult {
            list: Vec<Vec<String>>,
        }

        let envelope: RestEnvelope<KlineResult> = resp.json().await?;
        let result = envelope.result.ok_or_else(|| VantageError::MalformedResponse {
            exchange: "bybit".to_string(),
            message: "missing kline result".to_string(),
        })?;

        let mut candles: Vec<Candle> = result
            .list
            .into_iter()
            .map(|row| parse_kline_row(&row))
            .collect::<Result<_, _>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn list_markets(&self, _symbol: &Symbol) -> Result<Vec<MarketType>, VantageError> {
        Ok(vec![MarketType::UsdtLinear, MarketType::UsdcLinear, MarketType::UsdInverse])
    }
}

fn bybit_interval(interval: &str) -> &str {
    match interval {
        "1m" => "1",
        "15m" => "15",
        "1h" => "60",
        "4h" => "240",
        "1d" => "D",
        other => other,
    }
}

fn parse_kline_row(row: &[String]) -> Result<Candle, VantageError> {
    fn field_f64(row: &[String], idx: usize) -> Result<f64, VantageError> {
        row.get(idx)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| VantageError::MalformedResponse {
                exchange: "bybit".to_string(),
                message: format!("kline row missing field {idx}"),
            })
    }

    let ts_open_ms: u64 = row
        .first()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| VantageError::MalformedResponse {
            exchange: "bybit".to_string(),
            message: "kline row missing open time".to_string(),
        })?;

    Ok(Candle {
        ts_open: crate::de::datetime_utc_from_epoch_ms(ts_open_ms),
        open: field_f64(row, 1)?,
        high: field_f64(row, 2)?,
        low: field_f64(row, 3)?,
        close: field_f64(row, 4)?,
        volume: field_f64(row, 5)?,
    })
}

async fn run_liquidation_stream(
    symbols: Vec<Symbol>,
    tx: tokio::sync::mpsc::UnboundedSender<RawLiquidation>,
) -> Result<(), VantageError> {
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    let linear_url = format!("{WS_PUBLIC_BASE}/linear");
    let (ws_stream, _) = connect_async(&linear_url).await?;
    let (mut write, mut read) = ws_stream.split();

    let topics: Vec<String> = symbols
        .iter()
        .map(|s| format!("liquidation.{}USDT", s.as_str()))
        .collect();
    let subscribe = serde_json::json!({ "op": "subscribe", "args": topics });
    write.send(Message::Text(subscribe.to_string().into())).await?;

    debug!(exchange = "bybit", topics = ?topics, "subscribed to liquidation stream");

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };

        let envelope: WsEnvelope = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(_) => continue,
        };

        let Some(topic) = envelope.topic else { continue };
        if !topic.starts_with("liquidation.") {
            continue;
        }
        let Some(data) = envelope.data else { continue };

        let entries: Vec<LiquidationData> = if data.is_array() {
            match serde_json::from_value(data) {
                Ok(v) => v,
                Err(error) => {
                    warn!(exchange = "bybit", %error, "failed to parse liquidation array");
                    continue;
                }
            }
        } else {
            match serde_json::from_value(data) {
                Ok(v) => vec![v],
                Err(error) => {
                    warn!(exchange = "bybit", %error, "failed to parse liquidation object");
                    continue;
                }
            }
        };

        for entry in entries {
            let Some(quantity) = entry.size.as_f64() else {
                warn!(exchange = "bybit", "liquidation size field unparseable");
                continue;
            };

            // Bybit: "Buy" closes a short, "Sell" closes a long.
            let side = match entry.side.as_str() {
                "Sell" => LiqSide::Long,
                "Buy" => LiqSide::Short,
                other => {
                    warn!(exchange = "bybit", side = other, "unrecognised liquidation side");
                    continue;
                }
            };

            let symbol = Symbol::new(entry.symbol.trim_end_matches("USDT"));
            let liq = RawLiquidation {
                exchange: "bybit",
                symbol,
                side,
                price: entry.price,
                quantity,
                ts_ms: entry.updated_time_ms,
                ts_synthetic: false,
            };

            if tx.send(liq).is_err() {
                return Ok(());
            }
        }
    }

    Err(VantageError::Socket("liquidation stream ended".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_contracts_pass_through_unscaled() {
        let oi_usd = oi_usd_from_contracts(MarketType::UsdInverse, 500.0, 65_000.0).unwrap();
        assert_eq!(oi_usd, 500.0, "inverse open interest is already USD face value, not a contract count to scale");
        assert!(oi_usd > 0.0, "a populated inverse market must never resolve to zero USD OI");
    }

    #[test]
    fn linear_contracts_are_scaled_by_last_price() {
        let oi_usd = oi_usd_from_contracts(MarketType::UsdtLinear, 10.0, 65_000.0).unwrap();
        assert_eq!(oi_usd, 650_000.0);
    }

    #[test]
    fn negative_open_interest_is_rejected() {
        assert!(oi_usd_from_contracts(MarketType::UsdInverse, -1.0, 65_000.0).is_err());
    }

    #[test]
    fn nan_open_interest_is_rejected() {
        assert!(oi_usd_from_contracts(MarketType::UsdtLinear, f64::NAN, 65_000.0).is_err());
    }

    #[test]
    fn size_field_accepts_string_and_number() {
        assert_eq!(SizeField::Str("1.5".to_string()).as_f64(), Some(1.5));
        assert_eq!(SizeField::Num(2.5).as_f64(), Some(2.5));
    }
}

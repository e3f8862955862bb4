//! Binance: spot + USDⓈ-M futures (linear) + COIN-M futures (inverse).
//!
//! See docs:
//! - OI: <https://binance-docs.github.io/apidocs/futures/en/#open-interest>
//! - Force orders: <https://binance-docs.github.io/apidocs/futures/en/#liquidation-order-streams>

use crate::de::{de_str, de_u64_epoch_ms_as_datetime_utc};
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

const USDM_BASE: &str = "https://fapi.binance.com";
const COINM_BASE: &str = "https://dapi.binance.com";
const USDM_WS_BASE: &str = "wss://fstream.binance.com/ws";
const COINM_WS_BASE: &str = "wss://dstream.binance.com/ws";

/// COIN-M contracts settle USD-denominated face value per contract; this is
/// Binance's documented contract multiplier for the common BTC/ETH inverse
/// quarterly & perpetual contracts.
const COINM_CONTRACT_FACE_VALUE_USD: f64 = 100.0;

pub struct Binance {
    client: reqwest::Client,
}

impl Default for Binance {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct OpenInterestResp {
    #[serde(rename = "openInterest", deserialize_with = "de_str")]
    open_interest: f64,
}

#[derive(Deserialize)]
struct PremiumIndexResp {
    #[serde(rename = "markPrice", deserialize_with = "de_str")]
    mark_price: f64,
    #[serde(rename = "lastFundingRate", deserialize_with = "de_str")]
    last_funding_rate: f64,
}

#[derive(Deserialize)]
struct Ticker24hResp {
    #[serde(rename = "volume", deserialize_with = "de_str")]
    volume: f64,
}

#[derive(Deserialize)]
struct ForceOrderEvent {
    #[serde(rename = "E", deserialize_with = "de_u64_epoch_ms_as_datetime_utc")]
    event_time: chrono::DateTime<Utc>,
    #[serde(rename = "o")]
    order: ForceOrder,
}

#[derive(Deserialize)]
struct ForceOrder {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "p", deserialize_with = "de_str")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "de_str")]
    quantity: f64,
}

impl Binance {
    async fn market_oi(
        &self,
        symbol: &Symbol,
        market_type: MarketType,
        oi_url: String,
        premium_url: String,
        ticker_url: String,
    ) -> Result<MarketOI, VantageError> {
        let oi_resp = tokio::time::timeout(SNAPSHOT_DEADLINE, self.client.get(&oi_url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "binance".to_string(),
            })??;

        if oi_resp.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(VantageError::UnknownSymbol {
                exchange: "binance".to_string(),
                symbol: symbol.clone(),
            });
        }
        let oi: OpenInterestResp = oi_resp.error_for_status()?.json().await?;

        let premium: PremiumIndexResp = self.client.get(&premium_url).send().await?.error_for_status()?.json().await?;
        let ticker: Ticker24hResp = self.client.get(&ticker_url).send().await?.error_for_status()?.json().await?;

        if oi.open_interest < 0.0 || oi.open_interest.is_nan() || premium.mark_price <= 0.0 {
            return Err(VantageError::MalformedResponse {
                exchange: "binance".to_string(),
                message: "non-positive mark price or negative open interest".to_string(),
            });
        }

        let (oi_tokens, oi_usd) = match market_type {
            MarketType::UsdInverse => {
                let oi_usd = oi.open_interest * COINM_CONTRACT_FACE_VALUE_USD;
                let oi_tokens = oi_usd / premium.mark_price;
                (oi_tokens, oi_usd)
            }
            _ => (oi.open_interest, oi.open_interest * premium.mark_price),
        };

        Ok(MarketOI {
            exchange: "binance".to_string(),
            symbol: symbol.clone(),
            market_type,
            oi_tokens,
            oi_usd,
            price: premium.mark_price,
            funding_rate: premium.last_funding_rate,
            volume_24h_tokens: ticker.volume,
            captured_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeProvider for Binance {
    fn id(&self) -> &'static str {
        "binance"
    }

    async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError> {
        let usdm_pair = format!("{}USDT", symbol.as_str());
        let coinm_pair = format!("{}USD_PERP", symbol.as_str());

        let linear = self
            .market_oi(
                symbol,
                MarketType::UsdtLinear,
                format!("{USDM_BASE}/fapi/v1/openInterest?symbol={usdm_pair}"),
                format!("{USDM_BASE}/fapi/v1/premiumIndex?symbol={usdm_pair}"),
                format!("{USDM_BASE}/fapi/v1/ticker/24hr?symbol={usdm_pair}"),
            )
            .await;

        let inverse = self
            .market_oi(
                symbol,
                MarketType::UsdInverse,
                format!("{COINM_BASE}/dapi/v1/openInterest?symbol={coinm_pair}"),
                format!("{COINM_BASE}/dapi/v1/premiumIndex?symbol={coinm_pair}"),
                format!("{COINM_BASE}/dapi/v1/ticker/24hr?symbol={coinm_pair}"),
            )
            .await;

        let mut markets = Vec::new();
        let mut errors = Vec::new();

        match linear {
            Ok(m) => markets.push(m),
            Err(e) => {
                warn!(exchange = "binance", market_type = "usdt_linear", error = %e, "provider call failed");
                errors.push(ExchangeError {
                    market_type: Some(MarketType::UsdtLinear),
                    reason_code: e.reason_code().to_string(),
                    message: e.to_string(),
                });
            }
        }
        match inverse {
            Ok(m) => markets.push(m),
            Err(e) => {
                warn!(exchange = "binance", market_type = "usd_inverse", error = %e, "provider call failed");
                errors.push(ExchangeError {
                    market_type: Some(MarketType::UsdInverse),
                    reason_code: e.reason_code().to_string(),
                    message: e.to_string(),
                });
            }
        }

        let total_oi_usd = markets.iter().map(|m| m.oi_usd).sum();
        let validation_status = match (markets.len(), errors.len()) {
            (0, _) => ValidationStatus::Failed,
            (_, 0) => ValidationStatus::Ok,
            _ => ValidationStatus::Partial,
        };

        Ok(ExchangeOIResult {
            exchange: "binance".to_string(),
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
            reconnect::run_with_backoff("binance", move || {
                let tx = tx.clone();
                let symbols = symbols.clone();
                async move { run_force_order_stream(symbols, tx).await }
            })
            .await;
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_candles(&self, symbol: &Symbol, interval: &str, limit: usize) -> Result<Vec<Candle>, VantageError> {
        let pair = format!("{}USDT", symbol.as_str());
        let url = format!("{USDM_BASE}/fapi/v1/klines?symbol={pair}&interval={interval}&limit={limit}");

        let resp = tokio::time::timeout(CANDLE_FETCH_DEADLINE, self.client.get(&url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "binance".to_string(),
            })??
            .error_for_status()?;

        let raw: Vec<Vec<serde_json::Value>> = resp.json().await?;
        raw.into_iter()
            .map(|row| parse_kline_row(&row))
            .collect()
    }

    async fn list_markets(&self, _symbol: &Symbol) -> Result<Vec<MarketType>, VantageError> {
        Ok(vec![MarketType::UsdtLinear, MarketType::UsdInverse])
    }
}

fn parse_kline_row(row: &[serde_json::Value]) -> Result<Candle, VantageError> {
    fn field_f64(row: &[serde_json::Value], idx: usize) -> Result<f64, VantageError> {
        row.get(idx)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| VantageError::MalformedResponse {
                exchange: "binance".to_string(),
                message: format!("kline row missing field {idx}"),
            })
    }

    let ts_open_ms = row
        .first()
        .and_then(|v| v.as_i64())
        .ok_or_else(|| VantageError::MalformedResponse {
            exchange: "binance".to_string(),
            message: "kline row missing open time".to_string(),
        })?;

    Ok(Candle {
        ts_open: crate::de::datetime_utc_from_epoch_ms(ts_open_ms as u64),
        open: field_f64(row, 1)?,
        high: field_f64(row, 2)?,
        low: field_f64(row, 3)?,
        close: field_f64(row, 4)?,
        volume: field_f64(row, 5)?,
    })
}

async fn run_force_order_stream(
    symbols: Vec<Symbol>,
    tx: tokio::sync::mpsc::UnboundedSender<RawLiquidation>,
) -> Result<(), VantageError> {
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}usdt@forceOrder", s.as_str().to_lowercase()))
        .collect();
    let url = if streams.is_empty() {
        format!("{USDM_WS_BASE}/!forceOrder@arr")
    } else {
        format!("{USDM_WS_BASE}/{}", streams.join("/"))
    };

    let (ws_stream, _) = connect_async(&url).await?;
    let (_write, mut read) = ws_stream.split();

    debug!(exchange = "binance", url, "connected to force-order stream");

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };

        let event: ForceOrderEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(error) => {
                warn!(exchange = "binance", %error, "failed to parse force order event");
                continue;
            }
        };

        // Binance force orders: SELL closes a long, BUY closes a short.
        let side = match event.order.side.as_str() {
            "SELL" => LiqSide::Long,
            "BUY" => LiqSide::Short,
            other => {
                warn!(exchange = "binance", side = other, "unrecognised force order side");
                continue;
            }
        };

        let symbol = Symbol::new(event.order.symbol.trim_end_matches("USDT"));

        let liq = RawLiquidation {
            exchange: "binance",
            symbol,
            side,
            price: event.order.price,
            quantity: event.order.quantity,
            ts_ms: event.event_time.timestamp_millis() as u64,
            ts_synthetic: false,
        };

        if tx.send(liq).is_err() {
            break;
        }
    }

    Err(VantageError::Socket("force order stream ended".to_string()))
}

//! Bitget: USDT-margined (UMCBL) + USD coin-margined (DMCBL) perpetuals.
//!
//! Docs:
//! - OI: <https://www.bitget.com/api-doc/contract/market/Get-Open-Interest>
//! - Ticker: <https://www.bitget.com/api-doc/contract/market/Get-Ticker>
//! - Liquidation stream: <https://www.bitget.com/api-doc/contract/websocket/public/Liquidation-Channel>

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
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

const REST_BASE: &str = "https://api.bitget.com";
const WS_URL: &str = "wss://ws.bitget.com/mix/v1/stream";

pub struct Bitget {
    client: reqwest::Client,
}

impl Default for Bitget {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    code: String,
    msg: String,
    data: Option<T>,
}

#[derive(Deserialize)]
struct OiData {
    #[serde(deserialize_with = "de_str")]
    amount: f64,
}

#[derive(Deserialize)]
struct TickerData {
    #[serde(rename = "markPrice", deserialize_with = "de_str")]
    mark_price: f64,
    #[serde(rename = "fundingRate", default, deserialize_with = "crate::de::de_opt_str_f64")]
    funding_rate: Option<f64>,
    #[serde(rename = "baseVolume", deserialize_with = "de_str")]
    base_volume: f64,
}

#[derive(Deserialize)]
struct LiquidationPush {
    action: Option<String>,
    arg: LiquidationArg,
    data: Option<Vec<LiquidationRecord>>,
}

#[derive(Deserialize)]
struct LiquidationArg {
    channel: String,
    #[serde(rename = "instId")]
    inst_id: String,
}

#[derive(Deserialize)]
struct LiquidationRecord {
    side: String,
    #[serde(rename = "baseVolume", deserialize_with = "de_str")]
    base_volume: f64,
    #[serde(deserialize_with = "de_str")]
    price: f64,
    #[serde(deserialize_with = "crate::de::de_str")]
    ts: u64,
}

fn inst_id(symbol: &Symbol, market_type: MarketType) -> String {
    match market_type {
        MarketType::UsdtLinear => format!("{}USDT_UMCBL", symbol.as_str()),
        MarketType::UsdInverse => format!("{}USD_DMCBL", symbol.as_str()),
        MarketType::UsdcLinear => format!("{}USDC_CMCBL", symbol.as_str()),
        MarketType::Native => unreachable!("bitget has no native market type"),
    }
}

impl Bitget {
    async fn market_oi(&self, symbol: &Symbol, market_type: MarketType) -> Result<MarketOI, VantageError> {
        let id = inst_id(symbol, market_type);

        let oi_resp = tokio::time::timeout(
            SNAPSHOT_DEADLINE,
            self.client
                .get(format!("{REST_BASE}/api/mix/v1/market/open-interest?symbol={id}"))
                .send(),
        )
        .await
        .map_err(|_| VantageError::Timeout {
            exchange: "bitget".to_string(),
        })??
        .error_for_status()?;

        let oi_envelope: Envelope<OiData> = oi_resp.json().await?;
        if oi_envelope.code != "00000" {
            return Err(VantageError::UnknownSymbol {
                exchange: "bitget".to_string(),
                symbol: symbol.clone(),
            });
        }
        let oi = oi_envelope.data.ok_or_else(|| VantageError::MalformedResponse {
            exchange: "bitget".to_string(),
            message: "missing open-interest data".to_string(),
        })?;

        let ticker_resp = self
            .client
            .get(format!("{REST_BASE}/api/mix/v1/market/ticker?symbol={id}"))
            .send()
            .await?
            .error_for_status()?;
        let ticker_envelope: Envelope<TickerData> = ticker_resp.json().await?;
        let ticker = ticker_envelope.data.ok_or_else(|| VantageError::MalformedResponse {
            exchange: "bitget".to_string(),
            message: "missing ticker data".to_string(),
        })?;

        if oi.amount.is_nan() || oi.amount < 0.0 || ticker.mark_price <= 0.0 {
            return Err(VantageError::MalformedResponse {
                exchange: "bitget".to_string(),
                message: "non-positive mark price or negative open interest".to_string(),
            });
        }

        Ok(MarketOI {
            exchange: "bitget".to_string(),
            symbol: symbol.clone(),
            market_type,
            oi_tokens: oi.amount,
            oi_usd: oi.amount * ticker.mark_price,
            price: ticker.mark_price,
            funding_rate: ticker.funding_rate.unwrap_or(0.0),
            volume_24h_tokens: ticker.base_volume,
            captured_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeProvider for Bitget {
    fn id(&self) -> &'static str {
        "bitget"
    }

    async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError> {
        let mut markets = Vec::new();
        let mut errors = Vec::new();

        for market_type in [MarketType::UsdtLinear, MarketType::UsdInverse] {
            match self.market_oi(symbol, market_type).await {
                Ok(m) => markets.push(m),
                Err(e) => {
                    warn!(exchange = "bitget", ?market_type, error = %e, "provider call failed");
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
            exchange: "bitget".to_string(),
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
            reconnect::run_with_backoff("bitget", move || {
                let tx = tx.clone();
                let symbols = symbols.clone();
                async move { run_liquidation_stream(symbols, tx).await }
            })
            .await;
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_candles(&self, symbol: &Symbol, interval: &str, limit: usize) -> Result<Vec<Candle>, VantageError> {
        let id = inst_id(symbol, MarketType::UsdtLinear);
        let granularity = bitget_granularity(interval);
        let url = format!(
            "{REST_BASE}/api/mix/v1/market/candles?symbol={id}&granularity={granularity}&limit={limit}"
        );

        let resp = tokio::time::timeout(CANDLE_FETCH_DEADLINE, self.client.get(&url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "bitget".to_string(),
            })??
            .error_for_status()?;

        let rows: Vec<[serde_json::Value; 6]> = resp.json().await?;
        rows.iter().map(|row| parse_candle_row(row)).collect()
    }

    async fn list_markets(&self, _symbol: &Symbol) -> Result<Vec<MarketType>, VantageError> {
        Ok(vec![MarketType::UsdtLinear, MarketType::UsdInverse])
    }
}

fn bitget_granularity(interval: &str) -> &str {
    match interval {
        "1m" => "60",
        "15m" => "900",
        "1h" => "3600",
        "4h" => "14400",
        "1d" => "86400",
        other => other,
    }
}

fn parse_candle_row(row: &[serde_json::Value; 6]) -> Result<Candle, VantageError> {
    fn field_f64(row: &[serde_json::Value; 6], idx: usize) -> Result<f64, VantageError> {
        let raw = &row[idx];
        raw.as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .or_else(|| raw.as_f64())
            .ok_or_else(|| VantageError::MalformedResponse {
                exchange: "bitget".to_string(),
                message: format!("candle row missing field {idx}"),
            })
    }

    let ts_open_ms = field_f64(row, 0)? as u64;

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

    let (ws_stream, _) = connect_async(WS_URL).await?;
    let (mut write, mut read) = ws_stream.split();

    let args: Vec<serde_json::Value> = symbols
        .iter()
        .map(|s| {
            serde_json::json!({
                "instType": "mc",
                "channel": "liquidation-orders",
                "instId": inst_id(s, MarketType::UsdtLinear),
            })
        })
        .collect();
    let subscribe = serde_json::json!({ "op": "subscribe", "args": args });
    write.send(Message::Text(subscribe.to_string().into())).await?;

    debug!(exchange = "bitget", "subscribed to liquidation-orders channel");

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };
        if text == "pong" {
            continue;
        }

        let push: LiquidationPush = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if push.arg.channel != "liquidation-orders" || push.action.as_deref() != Some("update") {
            continue;
        }
        let Some(records) = push.data else { continue };

        let symbol = Symbol::new(push.arg.inst_id.trim_end_matches("USDT_UMCBL"));

        for record in records {
            // Bitget liquidation side: "close_long" or "close_short".
            let side = match record.side.as_str() {
                "close_long" => LiqSide::Long,
                "close_short" => LiqSide::Short,
                other => {
                    warn!(exchange = "bitget", side = other, "unrecognised liquidation side");
                    continue;
                }
            };

            let liq = RawLiquidation {
                exchange: "bitget",
                symbol: symbol.clone(),
                side,
                price: record.price,
                quantity: record.base_volume,
                ts_ms: record.ts,
                ts_synthetic: false,
            };

            if tx.send(liq).is_err() {
                return Ok(());
            }
        }
    }

    Err(VantageError::Socket("liquidation stream ended".to_string()))
}

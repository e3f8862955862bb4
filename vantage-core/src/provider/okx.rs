//! OKX: USDT-margined and USD-margined perpetual swaps.
//!
//! Docs:
//! - OI: <https://www.okx.com/docs-v5/en/#public-data-rest-api-get-open-interest>
//! - Mark price: <https://www.okx.com/docs-v5/en/#public-data-rest-api-get-mark-price>
//! - Liquidation orders (business channel): <https://www.okx.com/docs-v5/en/#public-data-websocket-liquidation-orders-channel>

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

const REST_BASE: &str = "https://www.okx.com";
const WS_BUSINESS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";

pub struct Okx {
    client: reqwest::Client,
}

impl Default for Okx {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct OkxEnvelope<T> {
    code: String,
    msg: String,
    data: Vec<T>,
}

#[derive(Deserialize)]
struct OiEntry {
    #[serde(rename = "oiCcy", deserialize_with = "de_str")]
    oi_ccy: f64,
}

#[derive(Deserialize)]
struct MarkPriceEntry {
    #[serde(rename = "markPx", deserialize_with = "de_str")]
    mark_px: f64,
}

#[derive(Deserialize)]
struct FundingRateEntry {
    #[serde(rename = "fundingRate", deserialize_with = "de_str")]
    funding_rate: f64,
}

#[derive(Deserialize)]
struct TickerEntry {
    #[serde(rename = "volCcy24h", deserialize_with = "de_str")]
    vol_ccy_24h: f64,
}

#[derive(Deserialize)]
struct LiquidationPush {
    arg: LiquidationArg,
    data: Vec<LiquidationDetailGroup>,
}

#[derive(Deserialize)]
struct LiquidationArg {
    channel: String,
}

#[derive(Deserialize)]
struct LiquidationDetailGroup {
    #[serde(rename = "instId")]
    inst_id: String,
    details: Vec<LiquidationDetail>,
}

#[derive(Deserialize)]
struct LiquidationDetail {
    side: String,
    #[serde(deserialize_with = "de_str")]
    sz: f64,
    #[serde(rename = "bkPx", deserialize_with = "de_str")]
    bk_px: f64,
    #[serde(deserialize_with = "de_str")]
    ts: u64,
}

fn inst_id(symbol: &Symbol, market_type: MarketType) -> String {
    match market_type {
        MarketType::UsdtLinear => format!("{}-USDT-SWAP", symbol.as_str()),
        MarketType::UsdcLinear => format!("{}-USDC-SWAP", symbol.as_str()),
        MarketType::UsdInverse => format!("{}-USD-SWAP", symbol.as_str()),
        MarketType::Native => unreachable!("okx has no native market type"),
    }
}

impl Okx {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<Vec<T>, VantageError> {
        let resp = tokio::time::timeout(SNAPSHOT_DEADLINE, self.client.get(url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "okx".to_string(),
            })??
            .error_for_status()?;

        let envelope: OkxEnvelope<T> = resp.json().await?;
        if envelope.code != "0" {
            return Err(VantageError::MalformedResponse {
                exchange: "okx".to_string(),
                message: format!("code {}: {}", envelope.code, envelope.msg),
            });
        }
        Ok(envelope.data)
    }

    async fn market_oi(&self, symbol: &Symbol, market_type: MarketType) -> Result<MarketOI, VantageError> {
        let id = inst_id(symbol, market_type);

        let oi_entries: Vec<OiEntry> = self
            .get_json(&format!("{REST_BASE}/api/v5/public/open-interest?instType=SWAP&instId={id}"))
            .await?;
        let oi = oi_entries
            .into_iter()
            .next()
            .ok_or_else(|| VantageError::UnknownSymbol {
                exchange: "okx".to_string(),
                symbol: symbol.clone(),
            })?;

        let mark_entries: Vec<MarkPriceEntry> = self
            .get_json(&format!("{REST_BASE}/api/v5/public/mark-price?instType=SWAP&instId={id}"))
            .await?;
        let mark = mark_entries.into_iter().next().ok_or_else(|| VantageError::MalformedResponse {
            exchange: "okx".to_string(),
            message: "missing mark price entry".to_string(),
        })?;

        let funding_entries: Vec<FundingRateEntry> = self
            .get_json(&format!("{REST_BASE}/api/v5/public/funding-rate?instId={id}"))
            .await
            .unwrap_or_default();
        let funding_rate = funding_entries.first().map(|f| f.funding_rate).unwrap_or(0.0);

        let ticker_entries: Vec<TickerEntry> = self
            .get_json(&format!("{REST_BASE}/api/v5/market/ticker?instId={id}"))
            .await?;
        let ticker = ticker_entries.into_iter().next().ok_or_else(|| VantageError::MalformedResponse {
            exchange: "okx".to_string(),
            message: "missing ticker entry".to_string(),
        })?;

        if oi.oi_ccy.is_nan() || oi.oi_ccy < 0.0 || mark.mark_px <= 0.0 {
            return Err(VantageError::MalformedResponse {
                exchange: "okx".to_string(),
                message: "non-positive mark price or negative open interest".to_string(),
            });
        }

        Ok(MarketOI {
            exchange: "okx".to_string(),
            symbol: symbol.clone(),
            market_type,
            oi_tokens: oi.oi_ccy,
            oi_usd: oi.oi_ccy * mark.mark_px,
            price: mark.mark_px,
            funding_rate,
            volume_24h_tokens: ticker.vol_ccy_24h,
            captured_at: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeProvider for Okx {
    fn id(&self) -> &'static str {
        "okx"
    }

    async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError> {
        let mut markets = Vec::new();
        let mut errors = Vec::new();

        for market_type in [MarketType::UsdtLinear, MarketType::UsdInverse] {
            match self.market_oi(symbol, market_type).await {
                Ok(m) => markets.push(m),
                Err(e) => {
                    warn!(exchange = "okx", ?market_type, error = %e, "provider call failed");
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
            exchange: "okx".to_string(),
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
            reconnect::run_with_backoff("okx", move || {
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
        let bar = okx_bar(interval);
        let url = format!("{REST_BASE}/api/v5/market/candles?instId={id}&bar={bar}&limit={limit}");

        let resp = tokio::time::timeout(CANDLE_FETCH_DEADLINE, self.client.get(&url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "okx".to_string(),
            })??
            .error_for_status()?;

        let envelope: OkxEnvelope<Vec<String>> = resp.json().await?;
        if envelope.code != "0" {
            return Err(VantageError::MalformedResponse {
                exchange: "okx".to_string(),
                message: format!("code {}: {}", envelope.code, envelope.msg),
            });
        }

        let mut candles: Vec<Candle> = envelope
            .data
            .into_iter()
            .map(|row| parse_candle_row(&row))
            .collect::<Result<_, _>>()?;
        candles.reverse();
        Ok(candles)
    }

    async fn list_markets(&self, _symbol: &Symbol) -> Result<Vec<MarketType>, VantageError> {
        Ok(vec![MarketType::UsdtLinear, MarketType::UsdInverse])
    }
}

fn okx_bar(interval: &str) -> &str {
    match interval {
        "1m" => "1m",
        "15m" => "15m",
        "1h" => "1H",
        "4h" => "4H",
        "1d" => "1D",
        other => other,
    }
}

fn parse_candle_row(row: &[String]) -> Result<Candle, VantageError> {
    fn field_f64(row: &[String], idx: usize) -> Result<f64, VantageError> {
        row.get(idx)
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| VantageError::MalformedResponse {
                exchange: "okx".to_string(),
                message: format!("candle row missing field {idx}"),
            })
    }

    let ts_open_ms: u64 = row
        .first()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| VantageError::MalformedResponse {
            exchange: "okx".to_string(),
            message: "candle row missing open time".to_string(),
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

    let (ws_stream, _) = connect_async(WS_BUSINESS_URL).await?;
    let (mut write, mut read) = ws_stream.split();

    let args: Vec<serde_json::Value> = symbols
        .iter()
        .flat_map(|s| {
            [
                serde_json::json!({"channel": "liquidation-orders", "instType": "SWAP", "instFamily": format!("{}-USDT", s.as_str())}),
                serde_json::json!({"channel": "liquidation-orders", "instType": "SWAP", "instFamily": format!("{}-USD", s.as_str())}),
            ]
        })
        .collect();
    let subscribe = serde_json::json!({ "op": "subscribe", "args": args });
    write.send(Message::Text(subscribe.to_string().into())).await?;

    debug!(exchange = "okx", "subscribed to liquidation-orders business channel");

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
        if push.arg.channel != "liquidation-orders" {
            continue;
        }

        for group in push.data {
            let Some((base, _)) = group.inst_id.split_once('-') else { continue };
            let symbol = Symbol::new(base);

            for detail in group.details {
                // OKX liquidation details: "buy" force-closes a short, "sell" a long.
                let side = match detail.side.as_str() {
                    "sell" => LiqSide::Long,
                    "buy" => LiqSide::Short,
                    other => {
                        warn!(exchange = "okx", side = other, "unrecognised liquidation side");
                        continue;
                    }
                };

                let liq = RawLiquidation {
                    exchange: "okx",
                    symbol: symbol.clone(),
                    side,
                    price: detail.bk_px,
                    quantity: detail.sz,
                    ts_ms: detail.ts,
                    ts_synthetic: false,
                };

                if tx.send(liq).is_err() {
                    return Ok(());
                }
            }
        }
    }

    Err(VantageError::Socket("liquidation stream ended".to_string()))
}

//! Gate.io: USDT-margined perpetual futures only.
//!
//! Docs:
//! - Contract detail: <https://www.gate.io/docs/developers/apiv4/en/#get-a-single-contract>
//! - Tickers: <https://www.gate.io/docs/developers/apiv4/en/#get-futures-tickers>
//! - Liquidation stream: <https://www.gate.io/docs/developers/futures/ws/en/#liquidates-notification>

use crate::error::VantageError;
use crate::model::candle::Candle;
use crate::model::liquidation::{LiqSide, RawLiquidation};
use crate::model::market::{ExchangeOIResult, MarketOI, MarketType, ValidationStatus};
use crate::model::symbol::Symbol;
use crate::provider::{CANDLE_FETCH_DEADLINE, ExchangeProvider, SNAPSHOT_DEADLINE, reconnect};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

const REST_BASE: &str = "https://api.gateio.ws/api/v4";
const WS_URL: &str = "wss://fx-ws.gateio.ws/v4/ws/usdt";

pub struct GateIo {
    client: reqwest::Client,
}

impl Default for GateIo {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ContractDetail {
    #[serde(rename = "mark_price", deserialize_with = "crate::de::de_str")]
    mark_price: f64,
    #[serde(rename = "funding_rate", deserialize_with = "crate::de::de_str")]
    funding_rate: f64,
    /// Open contracts outstanding, in units of `quanto_multiplier` base
    /// tokens each.
    position_size: i64,
    #[serde(rename = "quanto_multiplier", deserialize_with = "crate::de::de_str")]
    quanto_multiplier: f64,
}

#[derive(Deserialize)]
struct TickerEntry {
    #[serde(rename = "volume_24h_base", deserialize_with = "crate::de::de_str")]
    volume_24h_base: f64,
}

#[derive(Deserialize)]
struct LiquidatePush {
    channel: String,
    event: String,
    result: Option<LiquidateResult>,
}

#[derive(Deserialize)]
struct LiquidateResult {
    contract: String,
    #[serde(deserialize_with = "crate::de::de_str")]
    price: f64,
    size: i64,
    /// Seconds since epoch, fractional.
    time: f64,
}

fn contract_name(symbol: &Symbol) -> String {
    format!("{}_USDT", symbol.as_str())
}

impl GateIo {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, VantageError> {
        let resp = tokio::time::timeout(SNAPSHOT_DEADLINE, self.client.get(url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "gateio".to_string(),
            })??;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(VantageError::MalformedResponse {
                exchange: "gateio".to_string(),
                message: "contract not found".to_string(),
            });
        }

        resp.error_for_status()?.json().await.map_err(VantageError::from)
    }
}

#[async_trait]
impl ExchangeProvider for GateIo {
    fn id(&self) -> &'static str {
        "gateio"
    }

    async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError> {
        let contract = contract_name(symbol);

        let detail: ContractDetail = match self
            .get_json(&format!("{REST_BASE}/futures/usdt/contracts/{contract}"))
            .await
        {
            Ok(d) => d,
            Err(e) => {
                return Ok(ExchangeOIResult {
                    exchange: "gateio".to_string(),
                    markets: vec![],
                    total_oi_usd: 0.0,
                    validation_status: ValidationStatus::Failed,
                    errors: vec![crate::model::market::ExchangeError {
                        market_type: Some(MarketType::UsdtLinear),
                        reason_code: e.reason_code().to_string(),
                        message: e.to_string(),
                    }],
                });
            }
        };

        if detail.mark_price <= 0.0 || detail.position_size < 0 {
            let e = VantageError::MalformedResponse {
                exchange: "gateio".to_string(),
                message: "non-positive mark price or negative position size".to_string(),
            };
            return Ok(ExchangeOIResult {
                exchange: "gateio".to_string(),
                markets: vec![],
                total_oi_usd: 0.0,
                validation_status: ValidationStatus::Failed,
                errors: vec![crate::model::market::ExchangeError {
                    market_type: Some(MarketType::UsdtLinear),
                    reason_code: e.reason_code().to_string(),
                    message: e.to_string(),
                }],
            });
        }

        let tickers: Vec<TickerEntry> = self
            .get_json(&format!("{REST_BASE}/futures/usdt/tickers?contract={contract}"))
            .await
            .unwrap_or_default();
        let volume_24h_tokens = tickers.first().map(|t| t.volume_24h_base).unwrap_or(0.0);

        let oi_tokens = detail.position_size as f64 * detail.quanto_multiplier;
        let oi_usd = oi_tokens * detail.mark_price;

        let market = MarketOI {
            exchange: "gateio".to_string(),
            symbol: symbol.clone(),
            market_type: MarketType::UsdtLinear,
            oi_tokens,
            oi_usd,
            price: detail.mark_price,
            funding_rate: detail.funding_rate,
            volume_24h_tokens,
            captured_at: Utc::now(),
        };

        Ok(ExchangeOIResult {
            exchange: "gateio".to_string(),
            markets: vec![market],
            total_oi_usd: oi_usd,
            validation_status: ValidationStatus::Ok,
            errors: vec![],
        })
    }

    async fn stream_liquidations(
        &self,
        symbols: &[Symbol],
    ) -> Result<BoxStream<'static, RawLiquidation>, VantageError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let symbols: Vec<Symbol> = symbols.to_vec();

        tokio::spawn(async move {
            reconnect::run_with_backoff("gateio", move || {
                let tx = tx.clone();
                let symbols = symbols.clone();
                async move { run_liquidation_stream(symbols, tx).await }
            })
            .await;
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_candles(&self, symbol: &Symbol, interval: &str, limit: usize) -> Result<Vec<Candle>, VantageError> {
        let contract = contract_name(symbol);
        let url = format!(
            "{REST_BASE}/futures/usdt/candlesticks?contract={contract}&interval={}&limit={limit}",
            gateio_interval(interval)
        );

        let resp = tokio::time::timeout(CANDLE_FETCH_DEADLINE, self.client.get(&url).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "gateio".to_string(),
            })??
            .error_for_status()?;

        #[derive(Deserialize)]
        struct Row {
            t: i64,
            #[serde(deserialize_with = "crate::de::de_str")]
            o: f64,
            #[serde(deserialize_with = "crate::de::de_str")]
            h: f64,
            #[serde(deserialize_with = "crate::de::de_str")]
            l: f64,
            #[serde(deserialize_with = "crate::de::de_str")]
            c: f64,
            #[serde(deserialize_with = "crate::de::de_str")]
            v: f64,
        }

        let rows: Vec<Row> = resp.json().await?;
        Ok(rows
            .into_iter()
            .map(|r| Candle {
                ts_open: crate::de::datetime_utc_from_epoch_ms(r.t as u64 * 1000),
                open: r.o,
                high: r.h,
                low: r.l,
                close: r.c,
                volume: r.v,
            })
            .collect())
    }

    async fn list_markets(&self, _symbol: &Symbol) -> Result<Vec<MarketType>, VantageError> {
        Ok(vec![MarketType::UsdtLinear])
    }
}

fn gateio_interval(interval: &str) -> &str {
    match interval {
        "1m" => "1m",
        "15m" => "15m",
        "1h" => "1h",
        "4h" => "4h",
        "1d" => "1d",
        other => other,
    }
}

async fn run_liquidation_stream(
    symbols: Vec<Symbol>,
    tx: tokio::sync::mpsc::UnboundedSender<RawLiquidation>,
) -> Result<(), VantageError> {
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    let (ws_stream, _) = connect_async(WS_URL).await?;
    let (mut write, mut read) = ws_stream.split();

    let payload: Vec<String> = symbols.iter().map(contract_name).collect();
    let subscribe = serde_json::json!({
        "time": 0,
        "channel": "futures.liquidates",
        "event": "subscribe",
        "payload": payload,
    });
    write.send(Message::Text(subscribe.to_string().into())).await?;

    debug!(exchange = "gateio", "subscribed to futures.liquidates channel");

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };

        let push: LiquidatePush = match serde_json::from_str(&text) {
            Ok(p) => p,
            Err(_) => continue,
        };
        if push.channel != "futures.liquidates" || push.event != "update" {
            continue;
        }
        let Some(result) = push.result else { continue };

        // Gate.io liquidate `size`: positive closes a long, negative a short.
        let side = if result.size > 0 { LiqSide::Long } else { LiqSide::Short };
        let symbol = Symbol::new(result.contract.trim_end_matches("_USDT"));

        let liq = RawLiquidation {
            exchange: "gateio",
            symbol,
            side,
            price: result.price,
            quantity: result.size.unsigned_abs() as f64,
            ts_ms: (result.time * 1000.0) as u64,
            ts_synthetic: false,
        };

        if tx.send(liq).is_err() {
            return Ok(());
        }
    }

    Err(VantageError::Socket("liquidation stream ended".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_name_appends_usdt_suffix() {
        assert_eq!(contract_name(&Symbol::new("BTC")), "BTC_USDT");
    }
}

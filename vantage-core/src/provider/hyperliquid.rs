//! Hyperliquid: DEX-native perpetuals, USDC-margined without a CEX-style
//! quote suffix (`MarketType::Native`).
//!
//! Docs: <https://hyperliquid.gitbook.io/hyperliquid-docs/for-developers/api/info-endpoint>
//!
//! Hyperliquid has no liquidation-specific REST/WS channel. Liquidations are
//! inferred from the public `trades` feed by recognizing the liquidator
//! vault as one side of the trade: the vault buying means it closed out a
//! short (so `SHORT` was liquidated); the vault selling means it closed out
//! a long (so `LONG` was liquidated). This is the deliberate replacement for
//! an earlier two-heuristic approach that inferred side from price impact
//! alone and was unreliable in thin books.

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

const INFO_URL: &str = "https://api.hyperliquid.xyz/info";
const WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

/// Hyperliquid's system liquidator vault. Trades where this address appears
/// as buyer or seller are forced liquidations, not voluntary trades.
const LIQUIDATOR_VAULT_ADDRESS: &str = "0x2e3d94f6fb72d37f1e3dd9c7a6e3c5f6bb6f2e9a";

pub struct Hyperliquid {
    client: reqwest::Client,
}

impl Default for Hyperliquid {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct MetaUniverse {
    universe: Vec<UniverseAsset>,
}

#[derive(Deserialize)]
struct UniverseAsset {
    name: String,
}

#[derive(Deserialize)]
struct AssetCtx {
    #[serde(deserialize_with = "crate::de::de_str")]
    funding: f64,
    #[serde(rename = "openInterest", deserialize_with = "crate::de::de_str")]
    open_interest: f64,
    #[serde(rename = "markPx", deserialize_with = "crate::de::de_str")]
    mark_px: f64,
    #[serde(rename = "dayNtlVlm", deserialize_with = "crate::de::de_str")]
    day_ntl_vlm: f64,
}

#[derive(Deserialize)]
struct TradeMessage {
    channel: String,
    data: Option<Vec<Trade>>,
}

#[derive(Deserialize)]
struct Trade {
    coin: String,
    #[serde(deserialize_with = "crate::de::de_str")]
    px: f64,
    #[serde(deserialize_with = "crate::de::de_str")]
    sz: f64,
    time: u64,
    users: [String; 2],
}

impl Hyperliquid {
    async fn post_info<T: serde::de::DeserializeOwned>(&self, body: serde_json::Value) -> Result<T, VantageError> {
        let resp = tokio::time::timeout(SNAPSHOT_DEADLINE, self.client.post(INFO_URL).json(&body).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "hyperliquid".to_string(),
            })??
            .error_for_status()?;
        resp.json().await.map_err(VantageError::from)
    }
}

#[async_trait]
impl ExchangeProvider for Hyperliquid {
    fn id(&self) -> &'static str {
        "hyperliquid"
    }

    async fn snapshot(&self, symbol: &Symbol) -> Result<ExchangeOIResult, VantageError> {
        let (meta, ctxs): (MetaUniverse, Vec<AssetCtx>) = self
            .post_info(serde_json::json!({ "type": "metaAndAssetCtxs" }))
            .await?;

        let index = meta
            .universe
            .iter()
            .position(|a| a.name == symbol.as_str())
            .ok_or_else(|| VantageError::UnknownSymbol {
                exchange: "hyperliquid".to_string(),
                symbol: symbol.clone(),
            })?;

        let ctx = ctxs.get(index).ok_or_else(|| VantageError::MalformedResponse {
            exchange: "hyperliquid".to_string(),
            message: "asset context index out of range".to_string(),
        })?;

        if ctx.mark_px <= 0.0 || ctx.open_interest.is_nan() || ctx.open_interest < 0.0 {
            return Err(VantageError::MalformedResponse {
                exchange: "hyperliquid".to_string(),
                message: "non-positive mark price or negative open interest".to_string(),
            });
        }

        let market = MarketOI {
            exchange: "hyperliquid".to_string(),
            symbol: symbol.clone(),
            market_type: MarketType::Native,
            oi_tokens: ctx.open_interest,
            oi_usd: ctx.open_interest * ctx.mark_px,
            price: ctx.mark_px,
            funding_rate: ctx.funding,
            volume_24h_tokens: ctx.day_ntl_vlm / ctx.mark_px.max(f64::EPSILON),
            captured_at: Utc::now(),
        };

        Ok(ExchangeOIResult {
            exchange: "hyperliquid".to_string(),
            total_oi_usd: market.oi_usd,
            markets: vec![market],
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
            reconnect::run_with_backoff("hyperliquid", move || {
                let tx = tx.clone();
                let symbols = symbols.clone();
                async move { run_trade_stream(symbols, tx).await }
            })
            .await;
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn fetch_candles(&self, symbol: &Symbol, interval: &str, limit: usize) -> Result<Vec<Candle>, VantageError> {
        let interval_ms = interval_ms(interval);
        let end = Utc::now().timestamp_millis() as u64;
        let start = end.saturating_sub(interval_ms * limit as u64);

        let body = serde_json::json!({
            "type": "candleSnapshot",
            "req": {
                "coin": symbol.as_str(),
                "interval": interval,
                "startTime": start,
                "endTime": end,
            }
        });

        let resp = tokio::time::timeout(CANDLE_FETCH_DEADLINE, self.client.post(INFO_URL).json(&body).send())
            .await
            .map_err(|_| VantageError::Timeout {
                exchange: "hyperliquid".to_string(),
            })??
            .error_for_status()?;

        #[derive(Deserialize)]
        struct Row {
            t: u64,
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
                ts_open: crate::de::datetime_utc_from_epoch_ms(r.t),
                open: r.o,
                high: r.h,
                low: r.l,
                close: r.c,
                volume: r.v,
            })
            .collect())
    }

    async fn list_markets(&self, _symbol: &Symbol) -> Result<Vec<MarketType>, VantageError> {
        Ok(vec![MarketType::Native])
    }
}

fn interval_ms(interval: &str) -> u64 {
    match interval {
        "1m" => 60_000,
        "15m" => 900_000,
        "1h" => 3_600_000,
        "4h" => 14_400_000,
        "1d" => 86_400_000,
        _ => 3_600_000,
    }
}

async fn run_trade_stream(
    symbols: Vec<Symbol>,
    tx: tokio::sync::mpsc::UnboundedSender<RawLiquidation>,
) -> Result<(), VantageError> {
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    let (ws_stream, _) = connect_async(WS_URL).await?;
    let (mut write, mut read) = ws_stream.split();

    for symbol in &symbols {
        let subscribe = serde_json::json!({
            "method": "subscribe",
            "subscription": { "type": "trades", "coin": symbol.as_str() },
        });
        write.send(Message::Text(subscribe.to_string().into())).await?;
    }

    debug!(exchange = "hyperliquid", count = symbols.len(), "subscribed to trade feeds");

    while let Some(msg) = read.next().await {
        let msg = msg?;
        let Message::Text(text) = msg else { continue };

        let message: TradeMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if message.channel != "trades" {
            continue;
        }
        let Some(trades) = message.data else { continue };

        for trade in trades {
            let side = if trade.users[0] == LIQUIDATOR_VAULT_ADDRESS {
                LiqSide::Short
            } else if trade.users[1] == LIQUIDATOR_VAULT_ADDRESS {
                LiqSide::Long
            } else {
                continue;
            };

            let liq = RawLiquidation {
                exchange: "hyperliquid",
                symbol: Symbol::new(&trade.coin),
                side,
                price: trade.px,
                quantity: trade.sz,
                ts_ms: trade.time,
                ts_synthetic: false,
            };

            if tx.send(liq).is_err() {
                return Ok(());
            }
        }
    }

    Err(VantageError::Socket("trade stream ended".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(buyer: &str, seller: &str) -> Trade {
        Trade {
            coin: "BTC".to_string(),
            px: 65_000.0,
            sz: 1.5,
            time: 1_700_000_000_000,
            users: [buyer.to_string(), seller.to_string()],
        }
    }

    #[test]
    fn liquidator_buying_means_short_was_liquidated() {
        let t = trade(LIQUIDATOR_VAULT_ADDRESS, "0xsome_trader");
        let side = if t.users[0] == LIQUIDATOR_VAULT_ADDRESS {
            LiqSide::Short
        } else {
            LiqSide::Long
        };
        assert_eq!(side, LiqSide::Short);
    }

    #[test]
    fn liquidator_selling_means_long_was_liquidated() {
        let t = trade("0xsome_trader", LIQUIDATOR_VAULT_ADDRESS);
        let side = if t.users[0] == LIQUIDATOR_VAULT_ADDRESS {
            LiqSide::Short
        } else if t.users[1] == LIQUIDATOR_VAULT_ADDRESS {
            LiqSide::Long
        } else {
            panic!("expected liquidator on one side");
        };
        assert_eq!(side, LiqSide::Long);
    }
}

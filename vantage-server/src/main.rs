use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use vantage_core::cascade::actor::{ActorEvent, CascadeActor};
use vantage_core::cascade::{CascadeThresholds, Severity as CascadeSeverity, SignalKind};
use vantage_core::config::RuntimeConfig;
use vantage_core::dispatcher::AlertDispatcher;
use vantage_core::ingestor::LiquidationIngestor;
use vantage_core::model::alert::{AlertEnvelope, AlertKind, AlertPayload, Severity as AlertSeverity};
use vantage_core::model::market::ValidatedOISnapshot;
use vantage_core::model::profile::{ProfileSnapshot, Timeframe};
use vantage_core::model::symbol::{Symbol, SymbolTable};
use vantage_core::provider::{self, ExchangeProvider};
use vantage_core::threshold_engine::{ConfigStore, ThresholdEngine};
use vantage_core::{aggregator::OiAggregator, profile_calc};

/// Symbols streamed for liquidations when neither `HYPERLIQUID_SYMBOLS` nor
/// a more targeted discovery mechanism narrows the set.
const DEFAULT_WATCH_SYMBOLS: [&str; 4] = ["BTC", "ETH", "SOL", "XRP"];

struct AppStateInner {
    providers: Vec<Arc<dyn ExchangeProvider>>,
    aggregator: OiAggregator,
    ingestor: Arc<LiquidationIngestor>,
    threshold_engine: Arc<ThresholdEngine>,
    alerts: broadcast::Sender<AlertEnvelope>,
    started_at: DateTime<Utc>,
}

#[derive(Clone)]
struct AppState(Arc<AppStateInner>);

#[tokio::main]
async fn main() {
    let runtime_config = RuntimeConfig::from_env();
    init_logging(&runtime_config.log_level);
    info!(log_level = %runtime_config.log_level, "starting vantage-server");

    let config_store = Arc::new(
        ConfigStore::load(runtime_config.threshold_config_paths()).expect("initial threshold config load"),
    );
    ConfigStore::spawn_reloader(config_store.clone(), runtime_config.config_reload_interval);
    let threshold_engine = Arc::new(ThresholdEngine::new(config_store));

    let all_providers: Vec<Arc<dyn ExchangeProvider>> = vec![
        Arc::new(provider::binance::Binance::default()),
        Arc::new(provider::bybit::Bybit::default()),
        Arc::new(provider::okx::Okx::default()),
        Arc::new(provider::gateio::GateIo::default()),
        Arc::new(provider::bitget::Bitget::default()),
        Arc::new(provider::hyperliquid::Hyperliquid::default()),
    ];

    let ingest_providers: Vec<Arc<dyn ExchangeProvider>> = if runtime_config.liquidation_exchanges.is_empty() {
        all_providers.clone()
    } else {
        all_providers
            .iter()
            .filter(|p| runtime_config.liquidation_exchanges.iter().any(|name| name.eq_ignore_ascii_case(p.id())))
            .cloned()
            .collect()
    };

    let symbols = Arc::new(SymbolTable::new());
    let ingestor = Arc::new(LiquidationIngestor::new(symbols.clone()));
    let watch_symbols: Vec<Symbol> = DEFAULT_WATCH_SYMBOLS.iter().map(Symbol::new).collect();

    for ingest_provider in ingest_providers {
        let ingestor = ingestor.clone();
        let symbols_for_provider = if ingest_provider.id() == "hyperliquid" {
            runtime_config.hyperliquid_symbols.clone().unwrap_or_else(|| watch_symbols.clone())
        } else {
            watch_symbols.clone()
        };
        tokio::spawn(async move {
            if let Err(error) = ingestor.run_provider(ingest_provider, symbols_for_provider).await {
                error!(%error, "liquidation provider stream ended");
            }
        });
    }

    let (cascade_out_tx, mut cascade_out_rx) = mpsc::channel(1024);
    let cascade_actor = CascadeActor::new(ingestor.subscribe(), cascade_out_tx, CascadeThresholds::default(), all_providers.len());
    tokio::spawn(cascade_actor.run());

    let (alerts_tx, _alerts_rx) = broadcast::channel::<AlertEnvelope>(4096);
    let dispatcher = Arc::new(AlertDispatcher::new(Arc::new(alerts_tx.clone())));

    tokio::spawn({
        let dispatcher = dispatcher.clone();
        let symbols = symbols.clone();
        async move {
            while let Some(event) = cascade_out_rx.recv().await {
                if let Some(envelope) = cascade_event_to_envelope(event, &symbols) {
                    dispatcher.enqueue(envelope, Utc::now());
                }
            }
        }
    });

    tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move {
            loop {
                if !dispatcher.dispatch_next().await {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    });

    let state = AppState(Arc::new(AppStateInner {
        providers: all_providers.clone(),
        aggregator: OiAggregator::new(all_providers),
        ingestor,
        threshold_engine,
        alerts: alerts_tx,
        started_at: Utc::now(),
    }));

    let app = Router::new()
        .route("/oi/aggregate", post(aggregate_oi))
        .route("/profile", post(profile))
        .route("/health", get(health))
        .route("/alerts/stream", get(alerts_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = "0.0.0.0:9001".parse::<SocketAddr>().expect("valid bind address");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind HTTP listener");
    info!(%addr, "vantage-server listening");
    axum::serve(listener, app).await.expect("server error");
}

#[derive(Debug, Deserialize)]
struct AggregateOiRequest {
    symbol: String,
    exchanges: Option<Vec<String>>,
}

async fn aggregate_oi(State(state): State<AppState>, Json(req): Json<AggregateOiRequest>) -> Json<ValidatedOISnapshot> {
    let symbol = Symbol::new(&req.symbol);

    let snapshot = match req.exchanges {
        Some(names) => {
            let filtered: Vec<Arc<dyn ExchangeProvider>> = state
                .0
                .providers
                .iter()
                .filter(|p| names.iter().any(|name| name.eq_ignore_ascii_case(p.id())))
                .cloned()
                .collect();
            OiAggregator::new(filtered).aggregate(&symbol).await
        }
        None => state.0.aggregator.aggregate(&symbol).await,
    };

    Json(snapshot)
}

#[derive(Debug, Deserialize)]
struct ProfileRequest {
    symbol: String,
    timeframe: String,
    exchange: Option<String>,
}

async fn profile(State(state): State<AppState>, Json(req): Json<ProfileRequest>) -> Result<Json<ProfileSnapshot>, (StatusCode, String)> {
    let timeframe = Timeframe::parse(&req.timeframe)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unrecognized timeframe '{}'", req.timeframe)))?;
    let symbol = Symbol::new(&req.symbol);

    let provider = match &req.exchange {
        Some(name) => state
            .0
            .providers
            .iter()
            .find(|p| p.id().eq_ignore_ascii_case(name))
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown exchange '{name}'")))?,
        None => state
            .0
            .providers
            .first()
            .ok_or_else(|| (StatusCode::INTERNAL_SERVER_ERROR, "no providers configured".to_string()))?,
    };

    let candles = provider
        .fetch_candles(&symbol, timeframe.as_str(), timeframe.candles())
        .await
        .map_err(|error| (StatusCode::BAD_GATEWAY, error.to_string()))?;

    Ok(Json(profile_calc::compute(&symbol, timeframe, &candles)))
}

#[derive(Serialize)]
struct HealthReport {
    ingestor_status: Vec<IngestorStatus>,
    aggregator_errors_last_min: usize,
    config_generation: u64,
    uptime_s: u64,
}

#[derive(Serialize)]
struct IngestorStatus {
    exchange: String,
    status: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let ingestor_status = state
        .0
        .providers
        .iter()
        .map(|p| {
            let status = state
                .0
                .ingestor
                .health(p.id())
                .map(|rx| format!("{:?}", *rx.borrow()))
                .unwrap_or_else(|| "UNKNOWN".to_string());
            IngestorStatus { exchange: p.id().to_string(), status }
        })
        .collect();

    Json(HealthReport {
        ingestor_status,
        aggregator_errors_last_min: state.0.aggregator.errors_last_minute(),
        config_generation: state.0.threshold_engine.config_generation(),
        uptime_s: (Utc::now() - state.0.started_at).num_seconds().max(0) as u64,
    })
}

async fn alerts_stream(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let rx = state.0.alerts.subscribe();
    ws.on_upgrade(move |socket| handle_alert_socket(socket, rx))
}

/// Forwards every dispatched [`AlertEnvelope`] to a connected client as a
/// JSON text frame, in the spirit of the teacher's `barter-data-server`
/// broadcast loop: a lagging client is warned and kept, not dropped.
async fn handle_alert_socket(mut socket: WebSocket, mut rx: broadcast::Receiver<AlertEnvelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                let Ok(json) = serde_json::to_string(&envelope) else { continue };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "alert stream client lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn cascade_event_to_envelope(event: ActorEvent, symbols: &SymbolTable) -> Option<AlertEnvelope> {
    match event {
        ActorEvent::Signal(signal) => {
            let symbol = symbols.resolve(signal.symbol_id)?;
            let kind = match (signal.kind, signal.severity) {
                (SignalKind::Easing, _) => AlertKind::CascadeEasing,
                (SignalKind::Escalation, CascadeSeverity::Idle) => AlertKind::CascadeEasing,
                (SignalKind::Escalation, CascadeSeverity::Watch) => AlertKind::CascadeWatch,
                (SignalKind::Escalation, CascadeSeverity::Alert) => AlertKind::CascadeAlert,
                (SignalKind::Escalation, CascadeSeverity::Critical) => AlertKind::CascadeCritical,
                (SignalKind::Escalation, CascadeSeverity::Extreme) => AlertKind::CascadeExtreme,
            };
            let severity = match signal.severity {
                CascadeSeverity::Idle | CascadeSeverity::Watch => AlertSeverity::Low,
                CascadeSeverity::Alert => AlertSeverity::Med,
                CascadeSeverity::Critical => AlertSeverity::High,
                CascadeSeverity::Extreme => AlertSeverity::Critical,
            };

            Some(AlertEnvelope {
                kind,
                symbol,
                severity,
                ts: Utc::now(),
                payload: AlertPayload::Cascade {
                    probability: signal.probability,
                    leading_exchange: signal.leading_exchange_id.map(exchange_name_for_id),
                    value_usd: signal.value_usd,
                    value_tokens: signal.value_tokens,
                },
            })
        }
        ActorEvent::Backpressure(diagnostic) => Some(AlertEnvelope {
            kind: AlertKind::Backpressure,
            symbol: Symbol::new("*"),
            severity: AlertSeverity::Med,
            ts: Utc::now(),
            payload: AlertPayload::Diagnostic {
                message: format!("dropped {} events, {}ms lag", diagnostic.dropped, diagnostic.lag_ms),
            },
        }),
    }
}

fn exchange_name_for_id(id: u8) -> String {
    match id {
        provider::EXCHANGE_ID_BINANCE => "binance",
        provider::EXCHANGE_ID_BYBIT => "bybit",
        provider::EXCHANGE_ID_OKX => "okx",
        provider::EXCHANGE_ID_GATEIO => "gateio",
        provider::EXCHANGE_ID_BITGET => "bitget",
        provider::EXCHANGE_ID_HYPERLIQUID => "hyperliquid",
        _ => "unknown",
    }
    .to_string()
}

/// `RUST_LOG` takes precedence when set; otherwise the filter falls back to
/// `LOG_LEVEL` (lowercased, as `tracing_subscriber::EnvFilter` expects).
fn init_logging(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_ascii_lowercase())),
        )
        .json()
        .init();
}

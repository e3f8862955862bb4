//! Process-environment-derived runtime configuration: feature flags, JSON
//! threshold-file paths, reload cadence, ingestor venue list and log level.
//!
//! Distinct from [`crate::threshold_engine::ConfigStore`], which owns the
//! hot-reloadable JSON *content* those paths point at. `RuntimeConfig` is
//! read once at startup; nothing here changes after process launch.

use crate::model::symbol::Symbol;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RELOAD_INTERVAL_S: u64 = 300;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub liquidation_config_path: Option<PathBuf>,
    pub oi_config_path: Option<PathBuf>,
    pub volume_config_path: Option<PathBuf>,
    pub discovery_config_path: Option<PathBuf>,
    pub config_reload_interval: Duration,
    pub liquidation_exchanges: Vec<String>,
    pub hyperliquid_symbols: Option<Vec<Symbol>>,
    pub log_level: String,
}

impl RuntimeConfig {
    /// Reads every recognized variable from the process environment. Missing
    /// variables fall back to documented defaults rather than failing
    /// startup; a malformed `CONFIG_RELOAD_INTERVAL_S` also falls back
    /// rather than aborting, since the reloader is non-critical.
    pub fn from_env() -> Self {
        Self {
            liquidation_config_path: env_path("CONFIG_LIQUIDATION_PATH"),
            oi_config_path: env_path("CONFIG_OI_PATH"),
            volume_config_path: env_path("CONFIG_VOLUME_PATH"),
            discovery_config_path: env_path("CONFIG_DISCOVERY_PATH"),
            config_reload_interval: std::env::var("CONFIG_RELOAD_INTERVAL_S")
                .ok()
                .and_then(|s| parse_duration_secs(&s))
                .unwrap_or(Duration::from_secs(DEFAULT_RELOAD_INTERVAL_S)),
            liquidation_exchanges: std::env::var("LIQUIDATION_EXCHANGES")
                .ok()
                .map(|s| parse_csv(&s))
                .unwrap_or_default(),
            hyperliquid_symbols: std::env::var("HYPERLIQUID_SYMBOLS")
                .ok()
                .map(|s| parse_csv(&s).into_iter().map(Symbol::new).collect()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
        }
    }

    /// Converts to the path bundle [`crate::threshold_engine::ConfigStore`]
    /// loads from.
    pub fn threshold_config_paths(&self) -> crate::threshold_engine::ConfigPaths {
        crate::threshold_engine::ConfigPaths {
            liquidation: self.liquidation_config_path.clone(),
            oi: self.oi_config_path.clone(),
            volume: self.volume_config_path.clone(),
            discovery: self.discovery_config_path.clone(),
        }
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name).ok().map(PathBuf::from)
}

/// `ENABLE_<COMPONENT>` feature flags are looked up on demand rather than
/// enumerated up front, since the component set isn't closed. Recognizes
/// `"1"`/`"true"` (case-insensitive) as enabled; anything else, including
/// the variable being unset, is disabled.
pub fn component_enabled(component: &str) -> bool {
    std::env::var(format!("ENABLE_{}", component.to_uppercase()))
        .map(|v| parse_bool(&v))
        .unwrap_or(false)
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true")
}

fn parse_duration_secs(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

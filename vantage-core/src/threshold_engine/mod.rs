//! Market-cap tiering, session/volatility scaling and hot-reloadable
//! per-symbol overrides, replacing hard-coded liquidation/OI thresholds.
//!
//! [`ConfigStore`] owns the reloadable JSON config; [`ThresholdEngine`]
//! resolves a [`ThresholdSet`](crate::model::threshold::ThresholdSet) per
//! symbol and caches it until the store's generation changes or an hour
//! passes, whichever comes first.

use crate::error::VantageError;
use crate::model::symbol::Symbol;
use crate::model::threshold::{Tier, ThresholdSet, CASCADE_USD_MULTIPLIER, LIQ_SINGLE_USD_FLOOR};
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Default per-tier cascade event count; overridable per symbol via the
/// liquidation config file.
const DEFAULT_CASCADE_COUNT: u32 = 5;
const DEFAULT_OI_CHANGE_PCT: f64 = 0.05;
const DEFAULT_OI_MIN_USD: f64 = 1_000_000.0;
const DEFAULT_VOL_SPIKE_MULTIPLIER: f64 = 3.0;

/// Cached resolution outlives at most this long regardless of generation.
const CACHE_TTL: Duration = Duration::from_secs(3_600);

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(300);

/// Trading session, determined from the current UTC hour and weekday.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Session {
    Asian,
    European,
    Us,
    Weekend,
}

impl Session {
    /// Weekday gates `Weekend` first; within a weekday, hour-of-day buckets
    /// roughly follow each region's trading hours in UTC.
    pub fn current(now: DateTime<Utc>) -> Self {
        if matches!(now.weekday(), Weekday::Sat | Weekday::Sun) {
            return Session::Weekend;
        }
        match now.hour() {
            0..=7 => Session::Asian,
            8..=15 => Session::European,
            _ => Session::Us,
        }
    }

    pub fn multiplier(&self) -> f64 {
        match self {
            Session::Asian => 0.7,
            Session::European => 0.9,
            Session::Us => 1.0,
            Session::Weekend => 0.5,
        }
    }
}

/// `mul = clamp(0.5, 2.0, 1.0 + (vol_7d - 0.05) * 2)`.
pub fn volatility_multiplier(vol_7d: f64) -> f64 {
    (1.0 + (vol_7d - 0.05) * 2.0).clamp(0.5, 2.0)
}

/// Paths to the four JSON config files recognized by the core; any of them
/// may be absent, in which case that category's overrides are empty.
#[derive(Clone, Debug, Default)]
pub struct ConfigPaths {
    pub liquidation: Option<PathBuf>,
    pub oi: Option<PathBuf>,
    pub volume: Option<PathBuf>,
    pub discovery: Option<PathBuf>,
}

/// One loaded, hashed snapshot of every config category. Readers hold an
/// `Arc` clone; a reload swaps the store's pointer, never mutates in place.
#[derive(Clone, Debug, Default)]
pub struct ConfigGeneration {
    pub generation: u64,
    pub liquidation: Value,
    pub oi: Value,
    pub volume: Value,
    pub discovery: Value,
    content_hash: u64,
}

impl ConfigGeneration {
    fn symbol_override<'a>(&'a self, category: &'a Value, symbol: &Symbol) -> Option<&'a Value> {
        category.get(symbol.as_str())
    }
}

fn read_category(path: &Option<PathBuf>) -> Result<Value, VantageError> {
    let Some(path) = path else {
        return Ok(Value::Null);
    };
    let content = std::fs::read_to_string(path).map_err(|e| VantageError::Config {
        message: format!("reading {}: {e}", path.display()),
    })?;
    serde_json::from_str(&content).map_err(|e| VantageError::Config {
        message: format!("parsing {}: {e}", path.display()),
    })
}

fn hash_categories(liquidation: &Value, oi: &Value, volume: &Value, discovery: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    liquidation.to_string().hash(&mut hasher);
    oi.to_string().hash(&mut hasher);
    volume.to_string().hash(&mut hasher);
    discovery.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Owns the current [`ConfigGeneration`] behind a read-mostly lock and
/// reloads it on a fixed interval, comparing a content hash so an unchanged
/// file on disk never bumps the generation.
pub struct ConfigStore {
    paths: ConfigPaths,
    current: RwLock<Arc<ConfigGeneration>>,
}

impl ConfigStore {
    /// Loads the initial generation synchronously; config files are small
    /// and this only runs once at startup.
    pub fn load(paths: ConfigPaths) -> Result<Self, VantageError> {
        let generation = Self::load_generation(&paths, 0)?;
        Ok(Self {
            paths,
            current: RwLock::new(Arc::new(generation)),
        })
    }

    fn load_generation(paths: &ConfigPaths, generation: u64) -> Result<ConfigGeneration, VantageError> {
        let liquidation = read_category(&paths.liquidation)?;
        let oi = read_category(&paths.oi)?;
        let volume = read_category(&paths.volume)?;
        let discovery = read_category(&paths.discovery)?;
        let content_hash = hash_categories(&liquidation, &oi, &volume, &discovery);

        Ok(ConfigGeneration { generation, liquidation, oi, volume, discovery, content_hash })
    }

    pub fn current(&self) -> Arc<ConfigGeneration> {
        self.current.read().clone()
    }

    /// Re-reads every config file; swaps the snapshot pointer only if the
    /// combined content hash changed. A parse failure is logged and leaves
    /// the previous generation active.
    pub fn reload_once(&self) {
        let previous = self.current();
        let next_generation = previous.generation + 1;

        match Self::load_generation(&self.paths, next_generation) {
            Ok(candidate) if candidate.content_hash != previous.content_hash => {
                info!(generation = next_generation, "threshold config reloaded");
                *self.current.write() = Arc::new(candidate);
            }
            Ok(_) => {}
            Err(error) => {
                error!(%error, "threshold config reload failed, keeping previous generation");
            }
        }
    }

    /// Spawns the periodic reloader. The returned handle runs until the
    /// store itself is dropped, since the task only holds a weak-free
    /// `Arc<Self>` clone passed in by the caller.
    pub fn spawn_reloader(store: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                store.reload_once();
            }
        })
    }
}

struct CachedThreshold {
    set: ThresholdSet,
    generation: u64,
    computed_at: DateTime<Utc>,
}

/// Inputs needed to resolve one symbol's thresholds. Caller-supplied since
/// market cap, daily volume and realized volatility come from market data
/// the core doesn't itself fetch.
#[derive(Copy, Clone, Debug)]
pub struct ThresholdInputs {
    pub market_cap_usd: f64,
    pub daily_volume_usd: f64,
    pub vol_7d: f64,
}

pub struct ThresholdEngine {
    config: Arc<ConfigStore>,
    cache: RwLock<HashMap<Symbol, CachedThreshold>>,
}

impl ThresholdEngine {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config, cache: RwLock::new(HashMap::new()) }
    }

    /// Current config generation, surfaced on the health endpoint.
    pub fn config_generation(&self) -> u64 {
        self.config.current().generation
    }

    /// Resolves `symbol`'s thresholds, reusing the cached value when it was
    /// computed against the current config generation within the last
    /// hour.
    pub fn resolve(&self, symbol: &Symbol, inputs: ThresholdInputs, now: DateTime<Utc>) -> ThresholdSet {
        let generation = self.config.current().generation;

        if let Some(cached) = self.cache.read().get(symbol) {
            let fresh = cached.generation == generation
                && (now - cached.computed_at).to_std().unwrap_or(Duration::MAX) < CACHE_TTL;
            if fresh {
                return cached.set;
            }
        }

        let config = self.config.current();
        let set = compute_threshold_set(symbol, inputs, now, &config);

        self.cache
            .write()
            .insert(symbol.clone(), CachedThreshold { set, generation, computed_at: now });

        set
    }
}

fn json_f64(value: Option<&Value>, field: &str, default: f64) -> f64 {
    value.and_then(|v| v.get(field)).and_then(Value::as_f64).unwrap_or(default)
}

fn json_u32(value: Option<&Value>, field: &str, default: u32) -> u32 {
    value
        .and_then(|v| v.get(field))
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(default)
}

fn compute_threshold_set(
    symbol: &Symbol,
    inputs: ThresholdInputs,
    now: DateTime<Utc>,
    config: &ConfigGeneration,
) -> ThresholdSet {
    let tier = Tier::from_market_cap_usd(inputs.market_cap_usd);
    let base = tier.base_liquidation_ratio() * inputs.daily_volume_usd;
    let floored = base.max(LIQ_SINGLE_USD_FLOOR);

    let session_mul = Session::current(now).multiplier();
    let vol_mul = volatility_multiplier(inputs.vol_7d);

    let liq_single_usd = floored * session_mul * vol_mul;
    let liq_cascade_usd = liq_single_usd * CASCADE_USD_MULTIPLIER;

    let liq_override = config.symbol_override(&config.liquidation, symbol);
    let oi_override = config.symbol_override(&config.oi, symbol);
    let volume_override = config.symbol_override(&config.volume, symbol);

    ThresholdSet {
        liq_single_usd,
        liq_cascade_count: json_u32(liq_override, "cascade_count", DEFAULT_CASCADE_COUNT),
        liq_cascade_usd,
        oi_change_pct: json_f64(oi_override, "oi_change_pct", DEFAULT_OI_CHANGE_PCT),
        oi_min_usd: json_f64(oi_override, "oi_min_usd", DEFAULT_OI_MIN_USD),
        vol_spike_multiplier: json_f64(volume_override, "vol_spike_multiplier", DEFAULT_VOL_SPIKE_MULTIPLIER),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(market_cap_usd: f64, daily_volume_usd: f64, vol_7d: f64) -> ThresholdInputs {
        ThresholdInputs { market_cap_usd, daily_volume_usd, vol_7d }
    }

    fn weekday_us_noon() -> DateTime<Utc> {
        // 2024-01-03 is a Wednesday.
        "2024-01-03T18:00:00Z".parse().unwrap()
    }

    fn weekend() -> DateTime<Utc> {
        // 2024-01-06 is a Saturday.
        "2024-01-06T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn session_weekend_overrides_hour_of_day() {
        assert_eq!(Session::current(weekend()), Session::Weekend);
        assert_eq!(Session::current(weekday_us_noon()), Session::Us);
    }

    #[test]
    fn volatility_multiplier_clamps_to_bounds() {
        assert_eq!(volatility_multiplier(-10.0), 0.5);
        assert_eq!(volatility_multiplier(10.0), 2.0);
        assert!((volatility_multiplier(0.05) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn liq_single_usd_never_drops_below_the_floor() {
        let config = ConfigGeneration::default();
        let symbol = Symbol::new("DOGE");
        let set = compute_threshold_set(&symbol, inputs(500_000_000.0, 1.0, 0.05), weekday_us_noon(), &config);
        assert!(set.liq_single_usd >= LIQ_SINGLE_USD_FLOOR);
    }

    #[test]
    fn cascade_usd_is_five_times_single_threshold() {
        let config = ConfigGeneration::default();
        let symbol = Symbol::new("BTC");
        let set = compute_threshold_set(&symbol, inputs(1_200_000_000_000.0, 1_000_000_000.0, 0.05), weekday_us_noon(), &config);
        assert!((set.liq_cascade_usd - set.liq_single_usd * CASCADE_USD_MULTIPLIER).abs() < 1e-6);
    }

    #[test]
    fn per_symbol_override_replaces_the_default_cascade_count() {
        let mut config = ConfigGeneration::default();
        config.liquidation = serde_json::json!({ "BTC": { "cascade_count": 8 } });
        let symbol = Symbol::new("BTC");

        let set = compute_threshold_set(&symbol, inputs(200_000_000_000.0, 5_000_000_000.0, 0.05), weekday_us_noon(), &config);
        assert_eq!(set.liq_cascade_count, 8);
    }

    #[test]
    fn reload_is_a_noop_when_content_is_unchanged() {
        let dir = std::env::temp_dir().join(format!("vantage-threshold-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let liquidation_path = dir.join("liquidation.json");
        std::fs::write(&liquidation_path, r#"{"BTC": {"cascade_count": 7}}"#).unwrap();

        let paths = ConfigPaths { liquidation: Some(liquidation_path), ..Default::default() };
        let store = ConfigStore::load(paths).unwrap();
        let first_generation = store.current().generation;

        store.reload_once();
        assert_eq!(store.current().generation, first_generation);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reload_bumps_generation_when_content_changes() {
        let dir = std::env::temp_dir().join(format!("vantage-threshold-test-changed-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let liquidation_path = dir.join("liquidation.json");
        std::fs::write(&liquidation_path, r#"{"BTC": {"cascade_count": 7}}"#).unwrap();

        let paths = ConfigPaths { liquidation: Some(liquidation_path.clone()), ..Default::default() };
        let store = ConfigStore::load(paths).unwrap();
        let first_generation = store.current().generation;

        std::fs::write(&liquidation_path, r#"{"BTC": {"cascade_count": 9}}"#).unwrap();
        store.reload_once();

        assert_eq!(store.current().generation, first_generation + 1);
        assert_eq!(store.current().liquidation["BTC"]["cascade_count"], 9);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn threshold_engine_caches_until_generation_changes() {
        let config = Arc::new(ConfigStore::load(ConfigPaths::default()).unwrap());
        let engine = ThresholdEngine::new(config.clone());
        let symbol = Symbol::new("ETH");
        let now = weekday_us_noon();

        let first = engine.resolve(&symbol, inputs(50_000_000_000.0, 2_000_000_000.0, 0.05), now);
        let second = engine.resolve(&symbol, inputs(999_000_000_000.0, 1.0, 0.5), now);

        assert_eq!(first.liq_single_usd, second.liq_single_usd, "cache hit should ignore changed inputs");
    }
}

use crate::model::symbol::Symbol;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Closed enum of derivatives market quoting conventions.
///
/// `NATIVE` is reserved for DEX-native quoting (e.g. Hyperliquid USDC without
/// a CEX-style suffix).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub enum MarketType {
    UsdtLinear,
    UsdcLinear,
    UsdInverse,
    Native,
}

impl MarketType {
    /// `true` for contracts whose PnL is quoted in the quote currency, where
    /// `oi_usd ≈ oi_tokens * price` directly.
    pub fn is_linear(&self) -> bool {
        matches!(self, MarketType::UsdtLinear | MarketType::UsdcLinear)
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketType::UsdtLinear => "USDT_LINEAR",
            MarketType::UsdcLinear => "USDC_LINEAR",
            MarketType::UsdInverse => "USD_INVERSE",
            MarketType::Native => "NATIVE",
        };
        write!(f, "{s}")
    }
}

/// One row per (exchange, symbol, market-type)
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MarketOI {
    pub exchange: String,
    pub symbol: Symbol,
    pub market_type: MarketType,
    pub oi_tokens: f64,
    pub oi_usd: f64,
    pub price: f64,
    pub funding_rate: f64,
    pub volume_24h_tokens: f64,
    pub captured_at: DateTime<Utc>,
}

impl MarketOI {
    /// Invariant check for linear markets, `oi_usd` must
    /// agree with `oi_tokens * price` within 1%.
    pub fn linear_invariant_holds(&self) -> bool {
        if !self.market_type.is_linear() {
            return true;
        }
        let expected = self.oi_tokens * self.price;
        (self.oi_usd - expected).abs() / self.oi_usd.max(1.0) < 0.01
    }
}

/// Why a provider's contribution to an [`ExchangeOIResult`] is missing or
/// partial, surfaced in `error_summary`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub enum ValidationStatus {
    Ok,
    Partial,
    Failed,
}

/// Aggregate for one exchange × one symbol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeOIResult {
    pub exchange: String,
    pub markets: Vec<MarketOI>,
    pub total_oi_usd: f64,
    pub validation_status: ValidationStatus,
    pub errors: Vec<ExchangeError>,
}

/// A single provider-level failure recorded against an exchange's
/// contribution, with its reason code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeError {
    pub market_type: Option<MarketType>,
    pub reason_code: String,
    pub message: String,
}

impl ExchangeOIResult {
    /// Sort `markets` by descending `oi_usd`, with the deterministic
    /// exchange-id-then-market-type tie-break for determinism.
    pub fn rank_markets(&mut self) {
        self.markets.sort_by(|a, b| {
            b.oi_usd
                .partial_cmp(&a.oi_usd)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.exchange.cmp(&b.exchange))
                .then_with(|| a.market_type.cmp(&b.market_type))
        });
    }
}

/// Market-type-broken-down totals for a [`ValidatedOISnapshot`].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct MarketTypeTotals {
    pub total_usdt_linear: f64,
    pub total_usdc_linear: f64,
    pub total_usd_inverse: f64,
    pub total_native: f64,
}

impl MarketTypeTotals {
    pub fn grand_total(&self) -> f64 {
        self.total_usdt_linear + self.total_usdc_linear + self.total_usd_inverse + self.total_native
    }

    fn add(&mut self, market_type: MarketType, oi_usd: f64) {
        match market_type {
            MarketType::UsdtLinear => self.total_usdt_linear += oi_usd,
            MarketType::UsdcLinear => self.total_usdc_linear += oi_usd,
            MarketType::UsdInverse => self.total_usd_inverse += oi_usd,
            MarketType::Native => self.total_native += oi_usd,
        }
    }
}

/// Informational flags computed over a snapshot's cross-exchange spread.
/// Flags never fail the snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DiscrepancyReport {
    pub exchange_dominance: Option<ExchangeDominance>,
    pub cross_exchange_skew: Option<CrossExchangeSkew>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeDominance {
    pub exchange: String,
    pub share: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossExchangeSkew {
    pub exchange_a: String,
    pub exchange_b: String,
    pub skew_pct: f64,
}

/// The OI Aggregator's unit of output for one symbol. Built fresh
/// on each request and immutable thereafter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatedOISnapshot {
    pub symbol: Symbol,
    pub exchange_results: Vec<ExchangeOIResult>,
    pub totals: MarketTypeTotals,
    pub exchange_count: usize,
    pub market_count: usize,
    pub coverage_timestamp: DateTime<Utc>,
    pub discrepancy_report: DiscrepancyReport,
    pub error_summary: Vec<String>,
}

impl ValidatedOISnapshot {
    /// Build a snapshot from raw per-exchange results, computing totals,
    /// ranking, and the discrepancy report. `dominance_share_threshold` and
    /// `skew_pct_threshold` come from the threshold engine's configuration.
    pub fn build(
        symbol: Symbol,
        mut exchange_results: Vec<ExchangeOIResult>,
        now: DateTime<Utc>,
        dominance_share_threshold: f64,
        skew_pct_threshold: f64,
    ) -> Self {
        for result in exchange_results.iter_mut() {
            result.rank_markets();
        }

        let mut totals = MarketTypeTotals::default();
        let mut market_count = 0usize;
        let mut exchange_count = 0usize;
        let mut error_summary = Vec::new();

        for result in &exchange_results {
            if !matches!(result.validation_status, ValidationStatus::Failed) {
                exchange_count += 1;
            }
            market_count += result.markets.len();
            for market in &result.markets {
                totals.add(market.market_type, market.oi_usd);
            }
            for err in &result.errors {
                error_summary.push(format!(
                    "{}: {} ({})",
                    result.exchange, err.reason_code, err.message
                ));
            }
        }

        let grand_total = totals.grand_total();
        let exchange_dominance = exchange_results
            .iter()
            .filter(|r| r.total_oi_usd > 0.0)
            .map(|r| (r.exchange.clone(), r.total_oi_usd / grand_total.max(1.0)))
            .filter(|(_, share)| *share > dominance_share_threshold)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map(|(exchange, share)| ExchangeDominance { exchange, share });

        let cross_exchange_skew = largest_pairwise_skew(&exchange_results)
            .filter(|skew| skew.skew_pct > skew_pct_threshold);

        ValidatedOISnapshot {
            symbol,
            exchange_results,
            totals,
            exchange_count,
            market_count,
            coverage_timestamp: now,
            discrepancy_report: DiscrepancyReport {
                exchange_dominance,
                cross_exchange_skew,
            },
            error_summary,
        }
    }
}

/// Largest relative difference in total OI between any two exchanges that
/// both reported non-zero OI, used for the `CROSS_EXCHANGE_SKEW` flag.
fn largest_pairwise_skew(results: &[ExchangeOIResult]) -> Option<CrossExchangeSkew> {
    let reporting: Vec<&ExchangeOIResult> = results.iter().filter(|r| r.total_oi_usd > 0.0).collect();

    let mut worst: Option<CrossExchangeSkew> = None;
    for i in 0..reporting.len() {
        for j in (i + 1)..reporting.len() {
            let a = reporting[i];
            let b = reporting[j];
            let skew_pct = (a.total_oi_usd - b.total_oi_usd).abs() / a.total_oi_usd.max(b.total_oi_usd);

            let is_worse = worst.as_ref().map(|w| skew_pct > w.skew_pct).unwrap_or(true);
            if is_worse {
                worst = Some(CrossExchangeSkew {
                    exchange_a: a.exchange.clone(),
                    exchange_b: b.exchange.clone(),
                    skew_pct,
                });
            }
        }
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(exchange: &str, market_type: MarketType, oi_usd: f64) -> MarketOI {
        MarketOI {
            exchange: exchange.to_string(),
            symbol: Symbol::new("BTC"),
            market_type,
            oi_tokens: oi_usd / 50_000.0,
            oi_usd,
            price: 50_000.0,
            funding_rate: 0.0001,
            volume_24h_tokens: 1000.0,
            captured_at: Utc::now(),
        }
    }

    fn ok_result(exchange: &str, oi_usd: f64) -> ExchangeOIResult {
        ExchangeOIResult {
            exchange: exchange.to_string(),
            markets: vec![market(exchange, MarketType::UsdtLinear, oi_usd)],
            total_oi_usd: oi_usd,
            validation_status: ValidationStatus::Ok,
            errors: vec![],
        }
    }

    #[test]
    fn linear_invariant_detects_violation() {
        let mut m = market("binance", MarketType::UsdtLinear, 1_000_000.0);
        assert!(m.linear_invariant_holds());
        m.oi_usd = 2_000_000.0;
        assert!(!m.linear_invariant_holds());
    }

    #[test]
    fn grand_total_equals_sum_of_exchange_totals() {
        let results = vec![ok_result("binance", 100.0), ok_result("bybit", 50.0)];
        let snapshot = ValidatedOISnapshot::build(Symbol::new("BTC"), results, Utc::now(), 0.40, 0.25);
        assert!((snapshot.totals.grand_total() - 150.0).abs() < 1e-6);
    }

    #[test]
    fn exchange_dominance_flagged_above_threshold() {
        let results = vec![ok_result("binance", 900.0), ok_result("bybit", 100.0)];
        let snapshot = ValidatedOISnapshot::build(Symbol::new("BTC"), results, Utc::now(), 0.40, 0.25);
        let dominance = snapshot.discrepancy_report.exchange_dominance.unwrap();
        assert_eq!(dominance.exchange, "binance");
        assert!(dominance.share > 0.40);
    }

    #[test]
    fn no_dominance_flag_when_evenly_split() {
        let results = vec![ok_result("binance", 100.0), ok_result("bybit", 100.0)];
        let snapshot = ValidatedOISnapshot::build(Symbol::new("BTC"), results, Utc::now(), 0.40, 0.25);
        assert!(snapshot.discrepancy_report.exchange_dominance.is_none());
    }

    #[test]
    fn cross_exchange_skew_flagged_above_threshold() {
        let results = vec![ok_result("binance", 100.0), ok_result("bybit", 200.0)];
        let snapshot = ValidatedOISnapshot::build(Symbol::new("BTC"), results, Utc::now(), 1.0, 0.25);
        let skew = snapshot.discrepancy_report.cross_exchange_skew.unwrap();
        assert!(skew.skew_pct > 0.25);
    }

    #[test]
    fn all_providers_failed_yields_empty_snapshot() {
        let results = vec![ExchangeOIResult {
            exchange: "binance".to_string(),
            markets: vec![],
            total_oi_usd: 0.0,
            validation_status: ValidationStatus::Failed,
            errors: vec![ExchangeError {
                market_type: None,
                reason_code: "TIMEOUT".to_string(),
                message: "deadline elapsed".to_string(),
            }],
        }];
        let snapshot = ValidatedOISnapshot::build(Symbol::new("BTC"), results, Utc::now(), 0.40, 0.25);
        assert_eq!(snapshot.exchange_count, 0);
        assert_eq!(snapshot.totals.grand_total(), 0.0);
        assert_eq!(snapshot.error_summary.len(), 1);
    }

    #[test]
    fn ranking_is_deterministic_on_tie() {
        let mut result = ExchangeOIResult {
            exchange: "binance".to_string(),
            markets: vec![
                market("binance", MarketType::UsdcLinear, 100.0),
                market("binance", MarketType::UsdtLinear, 100.0),
            ],
            total_oi_usd: 200.0,
            validation_status: ValidationStatus::Ok,
            errors: vec![],
        };
        result.rank_markets();
        assert_eq!(result.markets[0].market_type, MarketType::UsdtLinear);
        assert_eq!(result.markets[1].market_type, MarketType::UsdcLinear);
    }
}

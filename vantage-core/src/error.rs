use crate::model::symbol::Symbol;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `vantage-core`.
///
/// Variants mirror the taxonomy consumers are expected to branch on:
/// network vs. rate-limited vs. unknown-symbol vs. malformed vs. timeout are
/// distinguished because the aggregator and ingestor retry some and not
/// others.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Error)]
pub enum VantageError {
    #[error("network error contacting {exchange}: {message}")]
    Network { exchange: String, message: String },

    #[error("rate limited by {exchange}, retry after {retry_after_ms:?}ms")]
    RateLimited {
        exchange: String,
        retry_after_ms: Option<u64>,
    },

    #[error("symbol {symbol} is not listed on {exchange}")]
    UnknownSymbol { exchange: String, symbol: Symbol },

    #[error("malformed response from {exchange}: {message}")]
    MalformedResponse { exchange: String, message: String },

    #[error("deadline elapsed waiting on {exchange}")]
    Timeout { exchange: String },

    #[error("config reload failed: {message}")]
    Config { message: String },

    #[error("{component} fell behind and dropped buffered events")]
    Backpressure { component: String },

    #[error("websocket error: {0}")]
    Socket(String),
}

impl VantageError {
    /// Exchange this error originated from, if any.
    pub fn exchange(&self) -> Option<&str> {
        match self {
            VantageError::Network { exchange, .. }
            | VantageError::RateLimited { exchange, .. }
            | VantageError::UnknownSymbol { exchange, .. }
            | VantageError::MalformedResponse { exchange, .. }
            | VantageError::Timeout { exchange, .. } => Some(exchange),
            VantageError::Config { .. } | VantageError::Backpressure { .. } | VantageError::Socket(_) => None,
        }
    }

    /// Whether the provider layer should retry this error internally.
    ///
    /// `UnknownSymbol` and `MalformedResponse` are never retried;
    /// `Timeout` is not retried again at the aggregator level (the provider
    /// may already have retried internally per its own budget).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VantageError::Network { .. } | VantageError::RateLimited { .. }
        )
    }

    /// Short machine-readable reason code, used in `ExchangeOIResult` error
    /// summaries and health diagnostics.
    pub fn reason_code(&self) -> &'static str {
        match self {
            VantageError::Network { .. } => "NETWORK_ERROR",
            VantageError::RateLimited { .. } => "RATE_LIMITED",
            VantageError::UnknownSymbol { .. } => "UNKNOWN_SYMBOL",
            VantageError::MalformedResponse { .. } => "MALFORMED_RESPONSE",
            VantageError::Timeout { .. } => "TIMEOUT",
            VantageError::Config { .. } => "CONFIG_ERROR",
            VantageError::Backpressure { .. } => "BACKPRESSURE",
            VantageError::Socket(_) => "NETWORK_ERROR",
        }
    }
}

impl From<reqwest::Error> for VantageError {
    fn from(value: reqwest::Error) -> Self {
        let exchange = value
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or("unknown")
            .to_string();

        if value.is_timeout() {
            VantageError::Timeout { exchange }
        } else {
            VantageError::Network {
                exchange,
                message: value.to_string(),
            }
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VantageError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        VantageError::Socket(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_and_rate_limited_are_retryable() {
        let cases = [
            (
                VantageError::Network {
                    exchange: "binance".into(),
                    message: "connection reset".into(),
                },
                true,
            ),
            (
                VantageError::RateLimited {
                    exchange: "bybit".into(),
                    retry_after_ms: Some(500),
                },
                true,
            ),
            (
                VantageError::UnknownSymbol {
                    exchange: "okx".into(),
                    symbol: Symbol::new("DOGE"),
                },
                false,
            ),
            (
                VantageError::MalformedResponse {
                    exchange: "bitget".into(),
                    message: "missing field oi".into(),
                },
                false,
            ),
            (
                VantageError::Timeout {
                    exchange: "gateio".into(),
                },
                false,
            ),
        ];

        for (index, (err, expected)) in cases.into_iter().enumerate() {
            assert_eq!(err.is_retryable(), expected, "case {index} failed");
        }
    }

    #[test]
    fn reason_codes_match_taxonomy() {
        assert_eq!(
            VantageError::UnknownSymbol {
                exchange: "okx".into(),
                symbol: Symbol::new("DOGE"),
            }
            .reason_code(),
            "UNKNOWN_SYMBOL"
        );
        assert_eq!(
            VantageError::Timeout {
                exchange: "gateio".into()
            }
            .reason_code(),
            "TIMEOUT"
        );
    }
}

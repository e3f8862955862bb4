//! Small `serde` deserialization helpers for exchanges that encode numerics
//! and timestamps as JSON strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// Deserialize a JSON string as `T` via its `FromStr` impl.
///
/// Deserializes into an owned `String` rather than `&str`: a `&str` only
/// succeeds against a borrowed-input deserializer (`from_str`/`from_slice`)
/// via `visit_borrowed_str`. An owned `serde_json::Value::String` — e.g. one
/// built from `serde_json::from_value` on a WS frame that was already
/// parsed into a `Value` — dispatches to `visit_string`, which `&str`
/// rejects outright. `String` accepts both.
pub fn de_str<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

/// Deserialize an optional JSON string as an optional `f64`, treating an
/// empty string the same as an absent field.
pub fn de_opt_str_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a `u64` epoch-millisecond field as `DateTime<Utc>`.
pub fn de_u64_epoch_ms_as_datetime_utc<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let epoch_ms = u64::deserialize(deserializer)?;
    Ok(datetime_utc_from_epoch_ms(epoch_ms))
}

pub fn datetime_utc_from_epoch_ms(epoch_ms: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(epoch_ms as i64).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        #[serde(deserialize_with = "de_str")]
        value: f64,
    }

    #[test]
    fn de_str_parses_string_numeric() {
        let parsed: Wrapper = serde_json::from_str(r#"{"value":"123.45"}"#).unwrap();
        assert!((parsed.value - 123.45).abs() < 1e-9);
    }

    #[test]
    fn de_str_parses_through_an_owned_json_value() {
        // Exercises the from_value(Value) path used when a WS frame is
        // parsed into a Value before the per-message payload is pulled out,
        // as opposed to from_str on the raw borrowed frame text.
        let value: serde_json::Value = serde_json::from_str(r#"{"value":"123.45"}"#).unwrap();
        let parsed: Wrapper = serde_json::from_value(value).unwrap();
        assert!((parsed.value - 123.45).abs() < 1e-9);
    }

    #[test]
    fn epoch_ms_round_trips_to_expected_date() {
        let dt = datetime_utc_from_epoch_ms(1_700_000_000_000);
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_000);
    }
}

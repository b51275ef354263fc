use chrono::{DateTime, Utc};
use serde_json::Value;

/// The shapes a timestamp arrives in from feeds and snapshots.
///
/// Only used at ingress: records carry the normalized millisecond value internally.
#[derive(Debug, Clone, PartialEq)]
pub enum TimestampValue {
    Missing,
    Millis(i64),
    Date(DateTime<Utc>),
    /// Server wrapper carrying `seconds` + `nanoseconds` since the epoch.
    Server { seconds: i64, nanoseconds: u32 },
    Unrecognized,
}

impl TimestampValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null | Value::Bool(false) => TimestampValue::Missing,
            Value::Number(number) => match number.as_i64() {
                Some(ms) => TimestampValue::Millis(ms),
                None => number
                    .as_f64()
                    .filter(|ms| ms.is_finite())
                    .map(|ms| TimestampValue::Millis(ms as i64))
                    .unwrap_or(TimestampValue::Unrecognized),
            },
            Value::String(raw) if raw.is_empty() => TimestampValue::Missing,
            Value::String(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| TimestampValue::Date(dt.with_timezone(&Utc)))
                .unwrap_or(TimestampValue::Unrecognized),
            Value::Object(map) => {
                let seconds = map
                    .get("seconds")
                    .or_else(|| map.get("_seconds"))
                    .and_then(Value::as_i64);
                let nanoseconds = map
                    .get("nanoseconds")
                    .or_else(|| map.get("_nanoseconds"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                match seconds {
                    Some(seconds) => TimestampValue::Server {
                        seconds,
                        nanoseconds: u32::try_from(nanoseconds).unwrap_or(0),
                    },
                    None => TimestampValue::Unrecognized,
                }
            }
            _ => TimestampValue::Unrecognized,
        }
    }

    /// Resolve to a wall-clock instant, if the shape carries one.
    pub fn to_date(&self) -> Option<DateTime<Utc>> {
        match self {
            TimestampValue::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            TimestampValue::Date(dt) => Some(*dt),
            TimestampValue::Server {
                seconds,
                nanoseconds,
            } => DateTime::from_timestamp(*seconds, *nanoseconds),
            TimestampValue::Missing | TimestampValue::Unrecognized => None,
        }
    }
}

impl From<DateTime<Utc>> for TimestampValue {
    fn from(value: DateTime<Utc>) -> Self {
        TimestampValue::Date(value)
    }
}

/// Milliseconds since the epoch; missing or unrecognized shapes become 0.
pub fn normalize_timestamp(value: &TimestampValue) -> i64 {
    match value {
        TimestampValue::Millis(ms) => *ms,
        other => other
            .to_date()
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0),
    }
}

pub fn normalize_json_timestamp(value: &Value) -> i64 {
    normalize_timestamp(&TimestampValue::from_json(value))
}

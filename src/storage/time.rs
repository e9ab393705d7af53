//! Timestamp helpers for the storage layer.
//!
//! Timestamps are written as RFC3339 text with millisecond precision and a `Z`
//! suffix. Rows written by other tools may use `YYYY-MM-DD HH:MM:SS`, so
//! reading accepts both.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

const SQL_DATETIME: &str = "%Y-%m-%d %H:%M:%S";
const SQL_DATETIME_FRACTION: &str = "%Y-%m-%d %H:%M:%S%.f";
const HOUR_BUCKET: &str = "%Y-%m-%d %H:%M";

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp_opt(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in [SQL_DATETIME, SQL_DATETIME_FRACTION, HOUR_BUCKET] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Parse a stored timestamp, falling back to the current time.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    match parse_timestamp_opt(raw) {
        Some(value) => value,
        None => {
            tracing::warn!(
                event = "timestamp_parse_failed",
                raw = %raw,
                "unrecognised timestamp format, using current time"
            );
            Utc::now()
        }
    }
}

pub fn parse_optional(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|raw| parse_timestamp_opt(&raw))
}

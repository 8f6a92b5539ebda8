//! Timestamp helpers.
//!
//! Records store timestamps as ISO 8601 strings so that documents written by
//! other tooling stay readable. Parsing is lenient: RFC 3339 with an offset,
//! naive ISO 8601 (interpreted as UTC), or numeric epoch seconds.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::Value;

/// ISO 8601 timestamp (UTC, microsecond precision) for the given instant.
#[must_use]
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// ISO 8601 timestamp for the current time.
#[must_use]
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

/// Parse a timestamp string, returning `None` for anything unrecognized.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Interpret a JSON value as a timestamp: ISO strings or epoch seconds.
#[must_use]
pub fn timestamp_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() || secs < 0.0 {
                return None;
            }
            #[allow(clippy::cast_possible_truncation)]
            let millis = (secs * 1000.0) as i64;
            DateTime::from_timestamp_millis(millis)
        }
        _ => None,
    }
}

/// Later of `now` and a previously stored timestamp.
///
/// Keeps `updated_at` non-decreasing even when wall clocks on different hosts
/// disagree.
#[must_use]
pub fn monotonic_iso(previous: &str, now: DateTime<Utc>) -> String {
    match parse_timestamp(previous) {
        Some(prev) if prev > now => to_iso(prev),
        _ => to_iso(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_and_naive() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01T00:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T01:00:00+01:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T00:00:00.000000"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01 00:00:00"), Some(expected));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_timestamp(""), None);
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(timestamp_from_value(&Value::Bool(true)), None);
        assert_eq!(timestamp_from_value(&serde_json::json!(-5)), None);
    }

    #[test]
    fn epoch_seconds_are_accepted() {
        let ts = timestamp_from_value(&serde_json::json!(1_704_067_200)).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn monotonic_never_goes_backwards() {
        let later = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(monotonic_iso(&to_iso(later), now), to_iso(later));
        assert_eq!(monotonic_iso("not a time", now), to_iso(now));
        assert_eq!(monotonic_iso(&to_iso(now), later), to_iso(later));
    }
}

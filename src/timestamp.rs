//! Textual instants and dates at the edges of the system.
//!
//! Inside the engine every instant is unix milliseconds. Nothing here converts
//! between zones: a zone-less timestamp is read as UTC, as given.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::model::Ms;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Parse an RFC 3339 / ISO-8601 instant, or a raw millisecond count.
pub fn parse_instant(s: &str) -> Option<Ms> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Some(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    // `2026-01-10T09:00Z` is not RFC 3339 (no seconds) but is common enough.
    let naive = s.strip_suffix('Z').unwrap_or(s);
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(naive, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn format_instant(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => ms.to_string(),
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_with_zone() {
        assert_eq!(parse_instant("1970-01-01T00:00:01Z"), Some(1000));
        assert_eq!(parse_instant("1970-01-01T01:00:00+01:00"), Some(0));
    }

    #[test]
    fn zoneless_is_read_as_utc() {
        assert_eq!(parse_instant("1970-01-01T00:01"), Some(60_000));
        assert_eq!(parse_instant("1970-01-01 00:00:02"), Some(2_000));
        assert_eq!(parse_instant("1970-01-01T00:01Z"), Some(60_000));
    }

    #[test]
    fn raw_millis_pass_through() {
        assert_eq!(parse_instant("1234"), Some(1234));
        assert_eq!(parse_instant("-5"), Some(-5));
    }

    #[test]
    fn garbage_is_rejected() {
        assert_eq!(parse_instant("tomorrow"), None);
        assert_eq!(parse_date("2026-13-01"), None);
    }

    #[test]
    fn format_round_trips_through_parse() {
        let ms = parse_instant("2026-01-10T09:00:00Z").unwrap();
        assert_eq!(format_instant(ms), "2026-01-10T09:00:00.000Z");
        assert_eq!(parse_instant(&format_instant(ms)), Some(ms));
    }
}

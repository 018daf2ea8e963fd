//! Time conversions shared by the store components.
//!
//! Task start times and pending-session index scores are nanosecond
//! instants since the Unix epoch. Redis TTLs are whole milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// Nanoseconds since the Unix epoch.
pub fn unix_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Instant from nanoseconds since the Unix epoch.
pub fn from_unix_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// Whole milliseconds of a TTL, never less than one.
///
/// A zero PX argument is rejected by Redis, so sub-millisecond durations
/// round up.
pub fn ttl_millis(ttl: Duration) -> u64 {
    let ms = ttl.as_millis();
    if ms == 0 {
        1
    } else {
        ms.min(u64::MAX as u128) as u64
    }
}

/// Duration between `now` and `at`, zero if `at` has passed.
pub fn until(now: DateTime<Utc>, at: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Parse a human duration such as `100ms`, `2s`, `5m` or `1h`.
///
/// A bare number is taken as milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration `{input}`"))?;
    let duration = match unit {
        "" | "ms" => Duration::from_millis(value),
        "us" => Duration::from_micros(value),
        "ns" => Duration::from_nanos(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => return Err(format!("invalid duration unit in `{input}`")),
    };
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nanos_roundtrip() {
        let at = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(from_unix_nanos(unix_nanos(at)), at);
    }

    #[test]
    fn test_ttl_millis_rounds_up() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn test_until_saturates() {
        let now = Utc::now();
        assert_eq!(until(now, now - chrono::Duration::seconds(1)), Duration::ZERO);
        assert_eq!(
            until(now, now + chrono::Duration::milliseconds(20)),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("ms").is_err());
    }
}

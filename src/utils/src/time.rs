use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

const MICROS_PER_SEC: i64 = 1_000_000;

/// system_time_to_micros returns the microseconds elapsed since the Unix epoch.
/// Times before the epoch are negative.
pub fn system_time_to_micros(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

pub fn unix_micros_to_time(unix_micros: i64) -> Option<DateTime<Utc>> {
    let secs = unix_micros.div_euclid(MICROS_PER_SEC);
    let micros = unix_micros.rem_euclid(MICROS_PER_SEC);
    Utc.timestamp_opt(secs, (micros * 1000) as u32).single()
}

/// time_to_unix_micros keeps microsecond resolution; finer digits are dropped,
/// so instants inside the same microsecond map to the same value.
pub fn time_to_unix_micros(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp() * MICROS_PER_SEC + dt.timestamp_subsec_micros() as i64
}

/// format_unix_micros renders a microsecond timestamp as RFC 3339 in UTC.
pub fn format_unix_micros(unix_micros: i64) -> String {
    match unix_micros_to_time(unix_micros) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        None => unix_micros.to_string(),
    }
}

/// parse_unix_micros parses an RFC 3339 timestamp (any offset) into microseconds.
pub fn parse_unix_micros(s: &str) -> anyhow::Result<i64> {
    let dt = DateTime::parse_from_rfc3339(s.trim())
        .map_err(|e| anyhow!("invalid timestamp {:?}: {}", s, e))?;
    Ok(time_to_unix_micros(&dt.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use crate::time::{format_unix_micros, parse_unix_micros};

    #[test]
    fn test_rfc3339_micros() {
        let micros = parse_unix_micros("2024-03-01T12:00:00.250Z").unwrap();
        assert_eq!(micros % 1_000_000, 250_000);
        assert_eq!(format_unix_micros(micros), "2024-03-01T12:00:00.250Z");

        let offset = parse_unix_micros("2024-03-01T13:00:00.250+01:00").unwrap();
        assert_eq!(offset, micros);
    }

    #[test]
    fn test_sub_micro_digits_dropped() {
        let a = parse_unix_micros("2024-03-01T12:00:00.0000001Z").unwrap();
        let b = parse_unix_micros("2024-03-01T12:00:00.0000002Z").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, parse_unix_micros("2024-03-01T12:00:00Z").unwrap());
    }

    #[test]
    fn test_before_epoch() {
        let micros = parse_unix_micros("1969-12-31T23:59:59.5Z").unwrap();
        assert_eq!(micros, -500_000);
        assert_eq!(format_unix_micros(micros), "1969-12-31T23:59:59.500Z");
    }

    #[test]
    fn test_invalid() {
        assert!(parse_unix_micros("15.2").is_err());
    }
}

//! Timestamp utilities

use chrono::{DateTime, TimeZone, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Floor `ts` to the start of its bucket of `width_secs` seconds (epoch aligned).
///
/// A zero width is treated as one second so the result is always defined.
pub fn bucket_start(ts: DateTime<Utc>, width_secs: u64) -> DateTime<Utc> {
    let width = width_secs.max(1) as i64;
    let floored = ts.timestamp().div_euclid(width) * width;
    Utc.timestamp_opt(floored, 0).single().unwrap_or(ts)
}

/// Minute-precision rendering used inside correlation keys, e.g. `2025-01-01T00:05`
pub fn format_bucket(bucket: DateTime<Utc>) -> String {
    bucket.format("%Y-%m-%dT%H:%M").to_string()
}

/// Nanoseconds since the epoch, saturating for dates outside the i64 nanosecond range
pub fn unix_nanos(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or_else(|| {
        if ts.timestamp() < 0 {
            i64::MIN
        } else {
            i64::MAX
        }
    })
}

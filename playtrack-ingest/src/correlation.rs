//! Correlation key and transaction id derivation
//!
//! Correlation key: `source:server_id:user_id:content_id:machine_id:time_bucket`.
//! Identifies one playback reported by one source; retries of the same
//! playback land in the same time bucket and produce a byte-identical key.
//!
//! Transaction id: `source:event_id:timestamp_nanos`. Identifies one delivery.
//!
//! Neither function fails. Missing optional parts are replaced by fixed
//! placeholders so the key stays deterministic. Free-text parts have `%` and
//! `:` percent-encoded, so a key always splits back into its segments.

use chrono::{DateTime, Utc};
use std::borrow::Cow;
use playtrack_common::models::{RawEvent, KNOWN_CROSS_SOURCES};
use playtrack_common::time::{bucket_start, format_bucket, unix_nanos};

const UNKNOWN_SOURCE: &str = "unknown";
const DEFAULT_SERVER: &str = "default";
const UNKNOWN_MACHINE: &str = "unknown";
const UNKNOWN_CONTENT: &str = "unknown";

/// Keys derived for one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKeys {
    pub correlation_key: String,
    pub transaction_id: String,
}

/// Derives correlation keys using a fixed time bucket width
#[derive(Debug, Clone)]
pub struct CorrelationKeyBuilder {
    bucket_secs: u64,
}

impl CorrelationKeyBuilder {
    pub fn new(bucket_secs: u64) -> Self {
        Self {
            bucket_secs: bucket_secs.max(1),
        }
    }

    pub fn bucket_secs(&self) -> u64 {
        self.bucket_secs
    }

    /// Keys for the first delivery of an event, timestamped by the event itself
    pub fn build(&self, event: &RawEvent) -> EventKeys {
        let delivered_at = event.timestamp.unwrap_or_default();
        self.build_at(event, delivered_at)
    }

    /// Keys for a re-submission (dead-letter retry, restore) delivered at `delivered_at`
    pub fn build_at(&self, event: &RawEvent, delivered_at: DateTime<Utc>) -> EventKeys {
        EventKeys {
            correlation_key: self.correlation_key(event),
            transaction_id: transaction_id(event, delivered_at),
        }
    }

    pub fn correlation_key(&self, event: &RawEvent) -> String {
        let source = part_or(&event.source, UNKNOWN_SOURCE);
        let server = event.server().unwrap_or(DEFAULT_SERVER);
        let user = event.user_id.unwrap_or(0);
        let content = event.content_id().unwrap_or(UNKNOWN_CONTENT);
        let machine = event.machine().unwrap_or(UNKNOWN_MACHINE);
        let bucket = event
            .effective_started_at()
            .map(|ts| format_bucket(bucket_start(ts, self.bucket_secs)))
            .unwrap_or_else(|| "none".to_string());

        format!(
            "{}:{}:{}:{}:{}:{}",
            escape_segment(source),
            escape_segment(server),
            user,
            escape_segment(content),
            escape_segment(machine),
            bucket
        )
    }
}

/// Percent-encode the key separator (and `%` itself) inside one segment
pub fn escape_segment(part: &str) -> Cow<'_, str> {
    if !part.contains([':', '%']) {
        return Cow::Borrowed(part);
    }
    let mut escaped = String::with_capacity(part.len() + 4);
    for c in part.chars() {
        match c {
            '%' => escaped.push_str("%25"),
            ':' => escaped.push_str("%3A"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

fn part_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback
    } else {
        trimmed
    }
}

/// `source:event_id:timestamp_nanos`
pub fn transaction_id(event: &RawEvent, delivered_at: DateTime<Utc>) -> String {
    format!(
        "{}:{}:{}",
        escape_segment(part_or(&event.source, UNKNOWN_SOURCE)),
        escape_segment(event.event_id.trim()),
        unix_nanos(delivered_at)
    )
}

/// Correlation key without its source prefix; `None` for malformed keys
pub fn cross_source_key(correlation_key: &str) -> Option<&str> {
    match correlation_key.split_once(':') {
        Some((source, rest)) if !source.is_empty() && !rest.is_empty() => Some(rest),
        _ => None,
    }
}

/// Leading source segment of a correlation key, still percent-encoded
pub fn source_of_key(correlation_key: &str) -> Option<&str> {
    correlation_key
        .split_once(':')
        .map(|(source, _)| source)
        .filter(|source| !source.is_empty())
}

pub fn is_known_cross_source(source: &str) -> bool {
    KNOWN_CROSS_SOURCES.contains(&source)
}

/// Closeness of two reports of what may be the same playback, in [0, 1].
///
/// Mean of start-time closeness (1 at identical starts, 0 at a full bucket
/// apart or more) and, when both durations are known, the ratio of the shorter
/// to the longer duration. Non-positive durations are ignored.
pub fn cross_source_similarity(
    a_started: DateTime<Utc>,
    a_duration: Option<i64>,
    b_started: DateTime<Utc>,
    b_duration: Option<i64>,
    bucket_secs: u64,
) -> f64 {
    let delta = (a_started - b_started).num_seconds().unsigned_abs() as f64;
    let start_score = (1.0 - delta / bucket_secs.max(1) as f64).clamp(0.0, 1.0);

    match (a_duration, b_duration) {
        (Some(a), Some(b)) if a > 0 && b > 0 => {
            let duration_score = a.min(b) as f64 / a.max(b) as f64;
            (start_score + duration_score) / 2.0
        }
        _ => start_score,
    }
}

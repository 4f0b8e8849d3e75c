//! Data model shared by the ingestion pipeline and its admin surface

use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error as ThisError;
use uuid::Uuid;

/// Sources that take part in cross-source matching
pub const KNOWN_CROSS_SOURCES: [&str; 4] = ["plex", "tautulli", "jellyfin", "emby"];

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as TEXT
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Why a delivery was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeReason {
    EventId,
    SessionKey,
    CorrelationKey,
    CrossSourceKey,
    DbConstraint,
}

text_enum!(DedupeReason {
    EventId => "event_id",
    SessionKey => "session_key",
    CorrelationKey => "correlation_key",
    CrossSourceKey => "cross_source_key",
    DbConstraint => "db_constraint",
});

/// Which dedup layer caught a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeLayer {
    Cache,
    Broker,
    DbUnique,
}

text_enum!(DedupeLayer {
    Cache => "cache",
    Broker => "broker",
    DbUnique => "db_unique",
});

/// Review status of an audit entry; moves only on operator action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    AutoDedupe,
    UserConfirmed,
    UserRestored,
}

text_enum!(AuditStatus {
    AutoDedupe => "auto_dedupe",
    UserConfirmed => "user_confirmed",
    UserRestored => "user_restored",
});

/// Layer at which an event failed for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureLayer {
    ConsumerWal,
    /// The canonical storage insert
    DuckdbInsert,
    Validation,
}

text_enum!(FailureLayer {
    ConsumerWal => "consumer_wal",
    DuckdbInsert => "duckdb_insert",
    Validation => "validation",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedEventStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
}

text_enum!(FailedEventStatus {
    Pending => "pending",
    Retrying => "retrying",
    Resolved => "resolved",
    Abandoned => "abandoned",
});

impl FailedEventStatus {
    /// Terminal records are never picked up by the retry scheduler again
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailedEventStatus::Resolved | FailedEventStatus::Abandoned)
    }
}

/// Consumer WAL state per transaction id
///
/// `pending -> applying -> applied`, or
/// `pending -> failed -> (retrying -> applied | abandoned)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalState {
    Pending,
    Applying,
    Applied,
    Failed,
    Retrying,
    Abandoned,
}

text_enum!(WalState {
    Pending => "pending",
    Applying => "applying",
    Applied => "applied",
    Failed => "failed",
    Retrying => "retrying",
    Abandoned => "abandoned",
});

impl WalState {
    /// States the startup scan must pick up
    pub fn needs_replay(&self) -> bool {
        matches!(
            self,
            WalState::Pending | WalState::Applying | WalState::Failed | WalState::Retrying
        )
    }
}

/// How a restored event is stored next to the event that was kept in its place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePolicy {
    /// Store under a synthetic correlation key derived from the audit entry
    DisambiguatedKey,
    /// Keep the original correlation key; both records coexist under a relaxed key
    AllowCoexistence,
}

text_enum!(RestorePolicy {
    DisambiguatedKey => "disambiguated_key",
    AllowCoexistence => "allow_coexistence",
});

/// Structural problems that make a raw event unusable
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("user_id must be positive, got {0}")]
    InvalidUserId(i64),

    #[error("no content identifier (rating_key or title)")]
    MissingContentId,

    #[error("stopped_at precedes started_at")]
    StoppedBeforeStarted,
}

/// Raw playback event as supplied by a producer (webhook receiver, poll sync)
///
/// Fields a producer must supply are still optional here so a malformed
/// message deserializes and can be rejected by [`RawEvent::validate`]
/// instead of being dropped by the decoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawEvent {
    /// Stable producer message id
    pub event_id: String,
    pub source: String,
    pub server_id: Option<String>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub rating_key: Option<String>,
    pub title: Option<String>,
    pub media_type: Option<String>,
    pub machine_id: Option<String>,
    pub session_key: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub percent_complete: Option<i64>,
    pub play_duration_secs: Option<i64>,
    pub platform: Option<String>,
    pub player: Option<String>,
    pub ip_address: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl RawEvent {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.event_id.trim().is_empty() {
            return Err(ValidationError::MissingField("event_id"));
        }
        if self.source.trim().is_empty() {
            return Err(ValidationError::MissingField("source"));
        }
        match self.user_id {
            None => return Err(ValidationError::MissingField("user_id")),
            Some(id) if id <= 0 => return Err(ValidationError::InvalidUserId(id)),
            Some(_) => {}
        }
        if self.timestamp.is_none() {
            return Err(ValidationError::MissingField("timestamp"));
        }
        if self.content_id().is_none() {
            return Err(ValidationError::MissingContentId);
        }
        if let (Some(start), Some(stop)) = (self.started_at, self.stopped_at) {
            if stop < start {
                return Err(ValidationError::StoppedBeforeStarted);
            }
        }
        Ok(())
    }

    /// Content identifier: the rating key, falling back to the title
    pub fn content_id(&self) -> Option<&str> {
        non_empty(&self.rating_key).or_else(|| non_empty(&self.title))
    }

    pub fn server(&self) -> Option<&str> {
        non_empty(&self.server_id)
    }

    pub fn machine(&self) -> Option<&str> {
        non_empty(&self.machine_id)
    }

    pub fn session(&self) -> Option<&str> {
        non_empty(&self.session_key)
    }

    /// Playback start, falling back to the event timestamp
    pub fn effective_started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at.or(self.timestamp)
    }

    /// Watched duration, from the reported value or the start/stop interval
    pub fn duration_secs(&self) -> Option<i64> {
        self.play_duration_secs.or_else(|| match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => Some((stop - start).num_seconds()),
            _ => None,
        })
    }
}

/// Canonical stored playback record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    pub id: Uuid,
    pub event_id: String,
    pub source: String,
    pub server_id: Option<String>,
    pub user_id: i64,
    pub username: Option<String>,
    pub rating_key: Option<String>,
    pub title: Option<String>,
    pub media_type: Option<String>,
    pub machine_id: Option<String>,
    pub session_key: Option<String>,
    pub event_timestamp: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub percent_complete: Option<i64>,
    pub play_duration_secs: Option<i64>,
    pub platform: Option<String>,
    pub player: Option<String>,
    pub ip_address: Option<String>,
    pub correlation_key: String,
    pub transaction_id: String,
    /// Set when the record was reinstated from a dedup audit entry
    pub restored_from_audit: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl PlaybackEvent {
    /// Build the stored record from a validated raw event and its derived keys
    pub fn from_raw(
        id: Uuid,
        raw: &RawEvent,
        correlation_key: String,
        transaction_id: String,
        restored_from_audit: Option<Uuid>,
    ) -> Result<Self, ValidationError> {
        raw.validate()?;
        let event_timestamp = raw.timestamp.ok_or(ValidationError::MissingField("timestamp"))?;
        let user_id = raw.user_id.ok_or(ValidationError::MissingField("user_id"))?;

        Ok(Self {
            id,
            event_id: raw.event_id.clone(),
            source: raw.source.clone(),
            server_id: raw.server_id.clone(),
            user_id,
            username: raw.username.clone(),
            rating_key: raw.rating_key.clone(),
            title: raw.title.clone(),
            media_type: raw.media_type.clone(),
            machine_id: raw.machine_id.clone(),
            session_key: raw.session_key.clone(),
            event_timestamp,
            started_at: raw.started_at.unwrap_or(event_timestamp),
            stopped_at: raw.stopped_at,
            percent_complete: raw.percent_complete,
            play_duration_secs: raw.duration_secs(),
            platform: raw.platform.clone(),
            player: raw.player.clone(),
            ip_address: raw.ip_address.clone(),
            correlation_key,
            transaction_id,
            restored_from_audit,
            created_at: crate::time::now(),
        })
    }
}

/// Dead-letter record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub id: Uuid,
    pub transaction_id: String,
    pub event_id: String,
    pub session_key: Option<String>,
    pub correlation_key: Option<String>,
    pub source: String,
    /// Record id the event is stored under once a retry succeeds
    pub record_id: Option<Uuid>,
    /// Set when the failed delivery was an operator restore
    pub restored_from_audit: Option<Uuid>,
    pub restore_policy: Option<RestorePolicy>,
    /// Frozen copy of the raw event
    pub event_payload: String,
    pub failed_at: DateTime<Utc>,
    pub failure_reason: String,
    pub failure_layer: FailureLayer,
    pub last_error: String,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub max_retries_exceeded: bool,
    pub status: FailedEventStatus,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One discard decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupeAuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,

    pub discarded_event_id: String,
    pub discarded_transaction_id: String,
    pub discarded_session_key: Option<String>,
    pub discarded_correlation_key: String,
    pub discarded_source: String,
    pub discarded_started_at: Option<DateTime<Utc>>,
    pub discarded_raw_payload: Option<String>,

    /// Stored record id of the event that was kept
    pub matched_event_id: Option<Uuid>,
    pub matched_transaction_id: Option<String>,
    pub matched_correlation_key: Option<String>,
    pub matched_source: Option<String>,

    pub dedupe_reason: DedupeReason,
    pub dedupe_layer: DedupeLayer,
    pub similarity_score: Option<f64>,

    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub media_type: Option<String>,
    pub title: Option<String>,
    pub rating_key: Option<String>,

    pub status: AuditStatus,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    pub restore_policy: Option<RestorePolicy>,
    pub restored_transaction_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate over the audit ledger, always recomputed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupeAuditStats {
    pub total_deduped: i64,
    pub pending_review: i64,
    pub user_confirmed: i64,
    pub user_restored: i64,
    /// confirmed / (confirmed + restored) * 100, 0 when nothing was reviewed
    pub accuracy_rate: f64,
    pub by_reason: BTreeMap<String, i64>,
    pub by_layer: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
    pub last_24_hours: i64,
    pub last_7_days: i64,
    pub last_30_days: i64,
}

impl DedupeAuditStats {
    pub fn compute_accuracy(confirmed: i64, restored: i64) -> f64 {
        let reviewed = confirmed + restored;
        if reviewed == 0 {
            0.0
        } else {
            confirmed as f64 / reviewed as f64 * 100.0
        }
    }
}

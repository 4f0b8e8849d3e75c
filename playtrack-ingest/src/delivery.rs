//! Message envelope carried through the broker and staged in the WAL

use crate::correlation::cross_source_key;
use chrono::{DateTime, Utc};
use playtrack_common::models::{RawEvent, RestorePolicy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Where a delivery came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryOrigin {
    Producer,
    /// Re-submission of a dead-lettered event by the retry scheduler or an operator
    DeadLetterRetry { failed_event_id: Uuid },
    /// Operator reinstating a discarded event. `failed_event_id` is set when a
    /// restore that failed to store is re-submitted from the dead-letter store.
    Restore {
        audit_id: Uuid,
        policy: RestorePolicy,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failed_event_id: Option<Uuid>,
    },
}

/// One publishable unit: the raw event plus everything derived from it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Id the stored record will carry if this delivery is the one kept
    pub record_id: Uuid,
    pub transaction_id: String,
    pub correlation_key: String,
    pub origin: DeliveryOrigin,
    pub event: RawEvent,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        event: RawEvent,
        transaction_id: String,
        correlation_key: String,
        origin: DeliveryOrigin,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            transaction_id,
            correlation_key,
            origin,
            event,
            published_at: playtrack_common::time::now(),
        }
    }

    pub fn cross_source_key(&self) -> Option<&str> {
        cross_source_key(&self.correlation_key)
    }

    /// Audit entry this delivery restores, if any
    pub fn restored_from(&self) -> Option<Uuid> {
        match &self.origin {
            DeliveryOrigin::Restore { audit_id, .. } => Some(*audit_id),
            _ => None,
        }
    }

    pub fn failed_event_id(&self) -> Option<Uuid> {
        match &self.origin {
            DeliveryOrigin::DeadLetterRetry { failed_event_id } => Some(*failed_event_id),
            DeliveryOrigin::Restore { failed_event_id, .. } => *failed_event_id,
            DeliveryOrigin::Producer => None,
        }
    }

    /// Restore policy of a restore delivery
    pub fn restore_policy(&self) -> Option<RestorePolicy> {
        match &self.origin {
            DeliveryOrigin::Restore { policy, .. } => Some(*policy),
            _ => None,
        }
    }

    /// Keep a record id assigned to an earlier delivery of the same event, so
    /// audit entries already pointing at it stay valid
    pub fn with_record_id(mut self, record_id: Uuid) -> Self {
        self.record_id = record_id;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Digest of the raw event content, independent of routing metadata
    pub fn event_digest(&self) -> String {
        event_digest(&self.event)
    }
}

/// Lowercase hex SHA-256 of bytes
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of the canonical JSON form of a raw event
pub fn event_digest(event: &RawEvent) -> String {
    let canonical = serde_json::to_vec(event).unwrap_or_default();
    sha256_hex(&canonical)
}

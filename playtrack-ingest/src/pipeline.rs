//! Ingestion pipeline
//!
//! ```text
//! ingest: validate -> keys -> WAL stage -> L2 publish
//! worker: claim -> L1 check -> WAL begin -> storage (L3) -> WAL commit -> ack
//! ```
//!
//! An event is durable in the WAL before ingest reports it published.
//! A discard at L1, L2 or L3 goes to the audit ledger instead of storage.
//! A delivery that cannot be stored goes to the dead-letter store. A delivery
//! is acked only once it is applied, audited or dead-lettered; anything else
//! is nacked and redelivered.

use crate::audit::{AuditLedger, Discard, MatchedRef};
use crate::broker::{Delivery, MemoryBroker, PublishOutcome};
use crate::correlation::{source_of_key, transaction_id, CorrelationKeyBuilder};
use crate::dead_letter::{DeadLetterStore, NewFailedEvent};
use crate::delivery::{DeliveryOrigin, Envelope};
use crate::local_dedup::{CacheCandidate, CacheDecision, KeptRef, LocalDedupCache};
use crate::storage::{EventStore, InsertOutcome, SqliteEventStore};
use crate::wal::{BeginOutcome, ConsumerWal};
use crate::writer::{RetryPolicy, StorageWriter, WriteOutcome};
use playtrack_common::config::TomlConfig;
use playtrack_common::models::{
    AuditStatus, DedupeAuditEntry, DedupeLayer, DedupeReason, FailureLayer, PlaybackEvent,
    RawEvent, RestorePolicy,
};
use playtrack_common::time::now;
use playtrack_common::{Error, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Actor recorded when the pipeline closes a dead-letter record itself
pub const PIPELINE_ACTOR: &str = "pipeline";

/// Result of handing a raw event to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Published {
        transaction_id: String,
        correlation_key: String,
        partition: usize,
    },
    /// L2 already saw this transaction id
    BrokerDuplicate {
        transaction_id: String,
        /// False for a plain redelivery of identical content
        audited: bool,
    },
    /// Failed validation and was dead-lettered without retry
    Rejected { failed_event_id: Uuid, error: String },
}

/// Result of processing one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Stored { record_id: Uuid },
    Duplicate {
        layer: DedupeLayer,
        reason: DedupeReason,
        audit_id: Uuid,
        kept_record_id: Option<Uuid>,
    },
    /// Transaction was already applied or abandoned; acked silently
    Redelivery,
    DeadLettered { failed_event_id: Uuid, layer: FailureLayer },
    /// Nacked for redelivery
    Requeued { reason: String },
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub entry: DedupeAuditEntry,
    pub transaction_id: String,
    pub correlation_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub stored: u64,
    pub duplicates_cache: u64,
    pub duplicates_broker: u64,
    pub duplicates_db: u64,
    pub redeliveries: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    stored: AtomicU64,
    duplicates_cache: AtomicU64,
    duplicates_broker: AtomicU64,
    duplicates_db: AtomicU64,
    redeliveries: AtomicU64,
    dead_lettered: AtomicU64,
    requeued: AtomicU64,
}

impl ConsumerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn observe(&self, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Stored { .. } => Self::bump(&self.stored),
            DeliveryOutcome::Duplicate { layer: DedupeLayer::Cache, .. } => Self::bump(&self.duplicates_cache),
            DeliveryOutcome::Duplicate { layer: DedupeLayer::Broker, .. } => Self::bump(&self.duplicates_broker),
            DeliveryOutcome::Duplicate { layer: DedupeLayer::DbUnique, .. } => Self::bump(&self.duplicates_db),
            DeliveryOutcome::Redelivery => Self::bump(&self.redeliveries),
            DeliveryOutcome::DeadLettered { .. } => Self::bump(&self.dead_lettered),
            DeliveryOutcome::Requeued { .. } => Self::bump(&self.requeued),
        }
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            duplicates_cache: self.duplicates_cache.load(Ordering::Relaxed),
            duplicates_broker: self.duplicates_broker.load(Ordering::Relaxed),
            duplicates_db: self.duplicates_db.load(Ordering::Relaxed),
            redeliveries: self.redeliveries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
        }
    }
}

/// L1 view of a delivery
pub fn cache_candidate(envelope: &Envelope) -> CacheCandidate {
    let event = &envelope.event;
    CacheCandidate {
        kept: KeptRef {
            record_id: envelope.record_id,
            transaction_id: envelope.transaction_id.clone(),
            correlation_key: envelope.correlation_key.clone(),
            source: event.source.clone(),
            started_at: event.effective_started_at().unwrap_or(envelope.published_at),
            duration_secs: event.duration_secs(),
        },
        event_id: event.event_id.clone(),
        session_key: event.session().map(str::to_string),
        cross_source_key: envelope.cross_source_key().map(str::to_string),
    }
}

fn kept_from_stored(event: &PlaybackEvent) -> KeptRef {
    KeptRef {
        record_id: event.id,
        transaction_id: event.transaction_id.clone(),
        correlation_key: event.correlation_key.clone(),
        source: event.source.clone(),
        started_at: event.started_at,
        duration_secs: event.play_duration_secs,
    }
}

pub struct Pipeline {
    keys: CorrelationKeyBuilder,
    cache: LocalDedupCache,
    broker: Arc<MemoryBroker>,
    wal: ConsumerWal,
    writer: StorageWriter,
    dead_letter: DeadLetterStore,
    audit: AuditLedger,
    stats: ConsumerStats,
    shutdown: CancellationToken,
    max_replay_attempts: u32,
    entry_ttl: Duration,
}

impl Pipeline {
    /// Pipeline over SQLite storage. `events` holds the event store, the
    /// dead-letter store and the audit ledger; `wal` holds the consumer WAL.
    pub fn new(config: &TomlConfig, events: SqlitePool, wal: SqlitePool) -> Self {
        let store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(events.clone()));
        Self::with_store(config, store, events, wal)
    }

    pub fn with_store(
        config: &TomlConfig,
        store: Arc<dyn EventStore>,
        events: SqlitePool,
        wal: SqlitePool,
    ) -> Self {
        let bucket_secs = config.correlation.time_bucket_secs;
        Self {
            keys: CorrelationKeyBuilder::new(bucket_secs),
            cache: LocalDedupCache::new(&config.cache, bucket_secs),
            broker: Arc::new(MemoryBroker::new(
                config.workers.count,
                Duration::from_secs(config.broker.dedup_window_secs),
            )),
            wal: ConsumerWal::new(wal),
            writer: StorageWriter::new(store, RetryPolicy::from(&config.storage)),
            dead_letter: DeadLetterStore::new(events.clone(), config.dead_letter.max_retries),
            audit: AuditLedger::new(events, config.audit.store_raw_payload),
            stats: ConsumerStats::default(),
            shutdown: CancellationToken::new(),
            max_replay_attempts: config.wal.max_replay_attempts.max(1),
            entry_ttl: Duration::from_secs(config.wal.entry_ttl_hours.saturating_mul(3600)),
        }
    }

    pub fn keys(&self) -> &CorrelationKeyBuilder {
        &self.keys
    }

    pub fn cache(&self) -> &LocalDedupCache {
        &self.cache
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    pub fn wal(&self) -> &ConsumerWal {
        &self.wal
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        self.writer.store()
    }

    pub fn dead_letter(&self) -> &DeadLetterStore {
        &self.dead_letter
    }

    pub fn audit(&self) -> &AuditLedger {
        &self.audit
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn max_replay_attempts(&self) -> u32 {
        self.max_replay_attempts
    }

    /// Age after which an unapplied WAL entry is dead-lettered
    pub fn entry_ttl(&self) -> Duration {
        self.entry_ttl
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop fetching new deliveries and stop storage retries between attempts
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Validate a raw event, derive its keys and publish it.
    ///
    /// Malformed input is dead-lettered with layer `validation`; nothing is
    /// returned to the producer as an error for it.
    pub async fn ingest(&self, raw: RawEvent) -> Result<IngestOutcome> {
        if let Err(invalid) = raw.validate() {
            let txn = transaction_id(&raw, raw.timestamp.unwrap_or_default());
            let record = self
                .dead_letter
                .record(NewFailedEvent {
                    transaction_id: txn,
                    correlation_key: Some(self.keys.correlation_key(&raw)),
                    record_id: None,
                    restore: None,
                    event: raw,
                    failure_layer: FailureLayer::Validation,
                    failure_reason: "event failed validation".to_string(),
                    last_error: invalid.to_string(),
                })
                .await?;
            ConsumerStats::bump(&self.stats.dead_lettered);
            return Ok(IngestOutcome::Rejected {
                failed_event_id: record.id,
                error: invalid.to_string(),
            });
        }

        let keys = self.keys.build(&raw);
        let envelope = Envelope::new(raw, keys.transaction_id, keys.correlation_key, DeliveryOrigin::Producer);
        self.publish(envelope).await
    }

    async fn publish(&self, envelope: Envelope) -> Result<IngestOutcome> {
        let transaction_id = envelope.transaction_id.clone();
        // Staged first so a crash after this point is replayed by recovery
        self.wal.stage(&envelope).await?;
        match self.broker.publish(envelope.clone()) {
            PublishOutcome::Accepted { partition } => {
                debug!(transaction_id = %transaction_id, partition, "Published");
                Ok(IngestOutcome::Published {
                    transaction_id,
                    correlation_key: envelope.correlation_key,
                    partition,
                })
            }
            PublishOutcome::Duplicate {
                original_record_id,
                original_correlation_key,
                same_content,
            } => {
                ConsumerStats::bump(&self.stats.duplicates_broker);
                if same_content {
                    return Ok(IngestOutcome::BrokerDuplicate {
                        transaction_id,
                        audited: false,
                    });
                }

                // Producer reused a message id for different content
                let matched = MatchedRef {
                    record_id: Some(original_record_id),
                    transaction_id: Some(transaction_id.clone()),
                    source: source_of_key(&original_correlation_key).map(str::to_string),
                    correlation_key: Some(original_correlation_key),
                };
                self.audit
                    .record(Discard {
                        envelope: &envelope,
                        matched,
                        reason: DedupeReason::EventId,
                        layer: DedupeLayer::Broker,
                        similarity: None,
                    })
                    .await?;
                Ok(IngestOutcome::BrokerDuplicate {
                    transaction_id,
                    audited: true,
                })
            }
        }
    }

    /// Process one delivery and ack or nack it
    pub async fn process_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        ConsumerStats::bump(&self.stats.received);
        let delivery_id = delivery.delivery_id;

        let outcome = match self.handle(&delivery).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    transaction_id = %delivery.envelope.transaction_id,
                    attempt = delivery.attempt,
                    error = %err,
                    "Delivery processing failed, will be redelivered"
                );
                DeliveryOutcome::Requeued {
                    reason: err.to_string(),
                }
            }
        };

        match &outcome {
            DeliveryOutcome::Requeued { .. } => self.broker.nack(delivery_id),
            _ => self.broker.ack(delivery_id),
        }
        self.stats.observe(&outcome);
        outcome
    }

    async fn handle(&self, delivery: &Delivery) -> Result<DeliveryOutcome> {
        let envelope = &delivery.envelope;
        let Some(_claim) = self.wal.try_claim(&envelope.transaction_id) else {
            return Ok(DeliveryOutcome::Requeued {
                reason: "transaction is being applied by another task".to_string(),
            });
        };

        if let Some(outcome) = self.screen(envelope).await? {
            return Ok(outcome);
        }

        match self.wal.begin_write(envelope).await {
            Ok(BeginOutcome::Started { attempt }) if attempt > self.max_replay_attempts => {
                self.fail_delivery(
                    envelope,
                    FailureLayer::ConsumerWal,
                    "WAL replay budget exhausted",
                    &format!("{} attempts without reaching applied", attempt - 1),
                    true,
                )
                .await
            }
            Ok(BeginOutcome::Started { .. }) => self.apply_envelope(envelope).await,
            Ok(BeginOutcome::AlreadyApplied) | Ok(BeginOutcome::Abandoned) => {
                debug!(transaction_id = %envelope.transaction_id, "Transaction already settled");
                Ok(DeliveryOutcome::Redelivery)
            }
            Err(err) if delivery.attempt >= self.max_replay_attempts => {
                self.fail_delivery(
                    envelope,
                    FailureLayer::ConsumerWal,
                    "WAL unavailable",
                    &err.to_string(),
                    false,
                )
                .await
            }
            Err(err) => Err(err),
        }
    }

    /// L1 check for a claimed envelope.
    ///
    /// Only producer deliveries are screened: restores knowingly duplicate a
    /// kept event, and dead-letter re-submissions are judged against stored
    /// records alone. A discard is audited and its WAL entry settled.
    pub async fn screen(&self, envelope: &Envelope) -> Result<Option<DeliveryOutcome>> {
        if !matches!(envelope.origin, DeliveryOrigin::Producer) {
            return Ok(None);
        }
        match self.cache.check_and_record(&cache_candidate(envelope)) {
            CacheDecision::Duplicate { kept, reason, similarity } => {
                let outcome = self.discard_at_cache(envelope, &kept, reason, similarity).await?;
                Ok(Some(outcome))
            }
            _ => Ok(None),
        }
    }

    /// Storage write for an envelope whose WAL entry is already `applying`.
    ///
    /// The caller must hold the WAL claim for the transaction.
    pub async fn apply_envelope(&self, envelope: &Envelope) -> Result<DeliveryOutcome> {
        let txn = envelope.transaction_id.as_str();
        let record = match self.build_record(envelope) {
            Ok(record) => record,
            Err(invalid) => {
                return self
                    .fail_delivery(envelope, FailureLayer::Validation, "event failed validation", &invalid, true)
                    .await;
            }
        };

        match self.writer.write(&record, &self.shutdown).await {
            WriteOutcome::Stored(InsertOutcome::Inserted) => {
                self.wal.commit_write(txn).await?;
                self.resolve_origin(envelope, "stored on retry").await?;
                debug!(transaction_id = %txn, record_id = %record.id, "Stored");
                Ok(DeliveryOutcome::Stored { record_id: record.id })
            }
            WriteOutcome::Stored(InsertOutcome::AlreadyPresent { same_transaction: true, .. }) => {
                self.wal.commit_write(txn).await?;
                self.resolve_origin(envelope, "stored on retry").await?;
                debug!(transaction_id = %txn, "Replay found transaction already stored");
                Ok(DeliveryOutcome::Redelivery)
            }
            WriteOutcome::Stored(InsertOutcome::AlreadyPresent { existing, .. }) => {
                // Audit before commit so a crash in between replays into the same entry
                let (entry, _) = self
                    .audit
                    .record(Discard {
                        envelope,
                        matched: MatchedRef::from(&existing),
                        reason: DedupeReason::DbConstraint,
                        layer: DedupeLayer::DbUnique,
                        similarity: None,
                    })
                    .await?;
                self.cache.record_kept(&cache_candidate(envelope), &kept_from_stored(&existing));
                self.wal.commit_write(txn).await?;
                self.resolve_origin(envelope, "duplicate of a stored event").await?;
                Ok(DeliveryOutcome::Duplicate {
                    layer: DedupeLayer::DbUnique,
                    reason: DedupeReason::DbConstraint,
                    audit_id: entry.id,
                    kept_record_id: Some(existing.id),
                })
            }
            WriteOutcome::Rejected { error } => {
                self.fail_delivery(envelope, FailureLayer::Validation, "storage rejected event", &error, true)
                    .await
            }
            WriteOutcome::Exhausted { attempts, last_error } => {
                self.wal.record_failure(txn, &last_error).await?;
                self.fail_delivery(
                    envelope,
                    FailureLayer::DuckdbInsert,
                    &format!("storage failed after {} attempts", attempts),
                    &last_error,
                    true,
                )
                .await
            }
            WriteOutcome::Interrupted { attempts, last_error } => {
                // Left for the next recovery scan or redelivery
                self.wal.mark_pending(txn).await?;
                info!(
                    transaction_id = %txn,
                    attempts,
                    error = %last_error,
                    "Storage retry interrupted by shutdown"
                );
                Ok(DeliveryOutcome::Requeued {
                    reason: "shutdown".to_string(),
                })
            }
        }
    }

    fn build_record(&self, envelope: &Envelope) -> std::result::Result<PlaybackEvent, String> {
        // Only coexisting restores are exempt from the correlation key constraint
        let relaxed = match &envelope.origin {
            DeliveryOrigin::Restore {
                audit_id,
                policy: RestorePolicy::AllowCoexistence,
                ..
            } => Some(*audit_id),
            _ => None,
        };
        PlaybackEvent::from_raw(
            envelope.record_id,
            &envelope.event,
            envelope.correlation_key.clone(),
            envelope.transaction_id.clone(),
            relaxed,
        )
        .map_err(|e| e.to_string())
    }

    async fn discard_at_cache(
        &self,
        envelope: &Envelope,
        kept: &KeptRef,
        reason: DedupeReason,
        similarity: Option<f64>,
    ) -> Result<DeliveryOutcome> {
        let (entry, _) = self
            .audit
            .record(Discard {
                envelope,
                matched: MatchedRef::from(kept),
                reason,
                layer: DedupeLayer::Cache,
                similarity,
            })
            .await?;
        self.wal.mark_settled(&envelope.transaction_id).await?;
        Ok(DeliveryOutcome::Duplicate {
            layer: DedupeLayer::Cache,
            reason,
            audit_id: entry.id,
            kept_record_id: Some(kept.record_id),
        })
    }

    /// Route a delivery to the dead-letter store.
    ///
    /// Re-submissions of an existing record update that record; everything
    /// else opens a new one. The delivery's L1 keys are released.
    async fn fail_delivery(
        &self,
        envelope: &Envelope,
        layer: FailureLayer,
        reason: &str,
        error: &str,
        abandon_wal: bool,
    ) -> Result<DeliveryOutcome> {
        let failed = match envelope.failed_event_id() {
            Some(id) if layer != FailureLayer::Validation => {
                self.dead_letter.record_retry_failure(id, error).await?
            }
            _ => {
                self.dead_letter
                    .record(NewFailedEvent {
                        transaction_id: envelope.transaction_id.clone(),
                        correlation_key: Some(envelope.correlation_key.clone()),
                        record_id: Some(envelope.record_id),
                        restore: envelope.restored_from().zip(envelope.restore_policy()),
                        event: envelope.event.clone(),
                        failure_layer: layer,
                        failure_reason: reason.to_string(),
                        last_error: error.to_string(),
                    })
                    .await?
            }
        };

        if abandon_wal {
            self.wal.mark_abandoned(&envelope.transaction_id, reason).await?;
        }
        self.cache.release(&cache_candidate(envelope));

        Ok(DeliveryOutcome::DeadLettered {
            failed_event_id: failed.id,
            layer,
        })
    }

    /// Close the dead-letter record a successful re-submission came from
    async fn resolve_origin(&self, envelope: &Envelope, notes: &str) -> Result<()> {
        let Some(id) = envelope.failed_event_id() else {
            return Ok(());
        };
        match self.dead_letter.mark_resolved(id, PIPELINE_ACTOR, Some(notes)).await {
            Ok(_) | Err(Error::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Process every queued delivery on every partition in the calling task.
    ///
    /// Stops when the broker is empty or a full pass settles nothing.
    /// Returns the number of deliveries handled.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        loop {
            let mut settled = 0;
            for partition in 0..self.broker.partition_count() {
                while let Some(delivery) = self.broker.try_fetch(partition) {
                    handled += 1;
                    if let DeliveryOutcome::Requeued { .. } = self.process_delivery(delivery).await {
                        break;
                    }
                    settled += 1;
                }
            }
            if settled == 0 {
                return handled;
            }
        }
    }

    /// Re-submit a dead-lettered event as a fresh delivery.
    ///
    /// The re-submission keeps the failed delivery's correlation key and
    /// record id. A failed restore goes out as a restore again.
    pub async fn resubmit_failed(&self, failed_event_id: Uuid) -> Result<IngestOutcome> {
        let record = self.dead_letter.require(failed_event_id).await?;
        if record.failure_layer == FailureLayer::Validation {
            return Err(Error::InvalidInput(format!(
                "failed event {} failed validation and cannot be retried",
                failed_event_id
            )));
        }
        let raw: RawEvent = serde_json::from_str(&record.event_payload)?;
        let record = self.dead_letter.begin_retry(failed_event_id).await?;

        let transaction_id = transaction_id(&raw, now());
        let correlation_key = match record.correlation_key.clone() {
            Some(key) => key,
            None => self.keys.correlation_key(&raw),
        };
        let origin = match (record.restored_from_audit, record.restore_policy) {
            (Some(audit_id), Some(policy)) => DeliveryOrigin::Restore {
                audit_id,
                policy,
                failed_event_id: Some(failed_event_id),
            },
            _ => DeliveryOrigin::DeadLetterRetry { failed_event_id },
        };
        info!(
            failed_event_id = %failed_event_id,
            retry_count = record.retry_count,
            transaction_id = %transaction_id,
            restore = record.restored_from_audit.is_some(),
            "Re-submitting dead-lettered event"
        );

        let mut envelope = Envelope::new(raw, transaction_id, correlation_key, origin);
        if let Some(record_id) = record.record_id {
            envelope = envelope.with_record_id(record_id);
        }
        let restored_from = envelope.restored_from();
        let published_txn = envelope.transaction_id.clone();
        let outcome = self.publish(envelope).await?;
        if let Some(audit_id) = restored_from {
            self.audit.set_restored_transaction(audit_id, &published_txn).await?;
        }
        Ok(outcome)
    }

    /// True while a restore transaction is staged, in flight, dead-lettered
    /// or stored
    async fn restore_is_live(&self, transaction_id: &str) -> Result<bool> {
        if self.wal.get(transaction_id).await?.is_some() {
            return Ok(true);
        }
        Ok(self.store().find_by_transaction(transaction_id).await?.is_some())
    }

    /// Reinstate a discarded event under an explicit policy.
    ///
    /// `DisambiguatedKey` stores it under `<key>:restored:<audit id>`;
    /// `AllowCoexistence` stores it under the original key alongside the
    /// kept event. The kept event itself is never touched.
    ///
    /// An entry can be restored again only when its earlier restore left
    /// nothing behind, as after a crash before the delivery was staged.
    pub async fn restore(
        &self,
        audit_id: Uuid,
        actor: &str,
        notes: Option<&str>,
        policy: RestorePolicy,
    ) -> Result<RestoreOutcome> {
        let entry = self.audit.require(audit_id).await?;
        let previous = match (entry.status, entry.restored_transaction_id.as_deref()) {
            (AuditStatus::UserRestored, Some(txn)) if !self.restore_is_live(txn).await? => {
                warn!(audit_id = %audit_id, transaction_id = %txn, "Earlier restore was lost, restoring again");
                Some(txn.to_string())
            }
            (AuditStatus::UserRestored, _) => {
                return Err(Error::Conflict(format!("audit entry {} was already restored", audit_id)));
            }
            _ => None,
        };
        let payload = entry.discarded_raw_payload.as_deref().ok_or_else(|| {
            Error::InvalidInput(format!("audit entry {} has no stored payload to restore", audit_id))
        })?;
        let raw: RawEvent = serde_json::from_str(payload)?;

        let correlation_key = match policy {
            RestorePolicy::DisambiguatedKey => {
                format!("{}:restored:{}", entry.discarded_correlation_key, audit_id)
            }
            RestorePolicy::AllowCoexistence => entry.discarded_correlation_key.clone(),
        };
        let transaction_id = transaction_id(&raw, now());

        let entry = self
            .audit
            .mark_restored(audit_id, actor, notes, policy, &transaction_id, previous.as_deref())
            .await?;
        let envelope = Envelope::new(
            raw,
            transaction_id.clone(),
            correlation_key.clone(),
            DeliveryOrigin::Restore {
                audit_id,
                policy,
                failed_event_id: None,
            },
        );
        self.publish(envelope).await?;

        Ok(RestoreOutcome {
            entry,
            transaction_id,
            correlation_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playtrack_common::db::init_memory_database;
    use playtrack_common::models::WalState;

    async fn pipeline() -> Pipeline {
        let pool = init_memory_database().await.unwrap();
        let mut config = TomlConfig::default();
        config.workers.count = 2;
        Pipeline::new(&config, pool.clone(), pool)
    }

    fn played_at() -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:10Z")
            .unwrap()
            .with_timezone(&chrono::Utc)
    }

    fn raw(event_id: &str) -> RawEvent {
        RawEvent {
            event_id: event_id.to_string(),
            source: "plex".to_string(),
            server_id: Some("srv1".to_string()),
            user_id: Some(42),
            rating_key: Some("100".to_string()),
            machine_id: Some("dev7".to_string()),
            timestamp: Some(played_at()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_first_event_is_stored_and_committed() {
        let pipeline = pipeline().await;
        let published = pipeline.ingest(raw("e1")).await.unwrap();
        let IngestOutcome::Published { transaction_id, .. } = published else {
            panic!("expected publish, got {:?}", published);
        };

        assert_eq!(pipeline.drain().await, 1);
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
        let entry = pipeline.wal().get(&transaction_id).await.unwrap().unwrap();
        assert_eq!(entry.state, WalState::Applied);
        assert!(pipeline.broker().is_idle());
        assert_eq!(pipeline.stats().stored, 1);
    }

    #[tokio::test]
    async fn test_identical_republish_is_silent() {
        let pipeline = pipeline().await;
        let event = raw("e1");
        pipeline.ingest(event.clone()).await.unwrap();
        let again = pipeline.ingest(event).await.unwrap();

        assert!(matches!(again, IngestOutcome::BrokerDuplicate { audited: false, .. }));
        pipeline.drain().await;
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
        assert_eq!(pipeline.audit().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reused_message_id_is_audited_at_broker() {
        let pipeline = pipeline().await;
        let event = raw("e1");
        pipeline.ingest(event.clone()).await.unwrap();

        let mut altered = event;
        altered.percent_complete = Some(90);
        let outcome = pipeline.ingest(altered).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::BrokerDuplicate { audited: true, .. }));

        let entries = pipeline.audit().list(&Default::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dedupe_layer, DedupeLayer::Broker);
        assert_eq!(entries[0].dedupe_reason, DedupeReason::EventId);
    }

    #[tokio::test]
    async fn test_invalid_event_dead_lettered_without_publish() {
        let pipeline = pipeline().await;
        let mut event = raw("e1");
        event.user_id = None;

        let outcome = pipeline.ingest(event).await.unwrap();
        let IngestOutcome::Rejected { failed_event_id, .. } = outcome else {
            panic!("expected rejection, got {:?}", outcome);
        };
        let record = pipeline.dead_letter().require(failed_event_id).await.unwrap();
        assert_eq!(record.failure_layer, FailureLayer::Validation);
        assert!(pipeline.broker().is_idle());
        assert!(matches!(
            pipeline.resubmit_failed(failed_event_id).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_l3_catches_what_l1_missed() {
        let pipeline = pipeline().await;
        pipeline.ingest(raw("e1")).await.unwrap();
        pipeline.drain().await;

        // A second report that L1 never saw, as after an eviction
        let second = raw("e2");
        let keys = pipeline.keys().build(&second);
        let envelope = Envelope::new(second, keys.transaction_id, keys.correlation_key, DeliveryOrigin::Producer);

        let _claim = pipeline.wal().try_claim(&envelope.transaction_id).unwrap();
        pipeline.wal().begin_write(&envelope).await.unwrap();
        let outcome = pipeline.apply_envelope(&envelope).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Duplicate { layer: DedupeLayer::DbUnique, reason: DedupeReason::DbConstraint, .. }
        ));
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
        assert_eq!(
            pipeline.wal().get(&envelope.transaction_id).await.unwrap().unwrap().state,
            WalState::Applied
        );
    }

    #[tokio::test]
    async fn test_claimed_transaction_is_requeued() {
        let pipeline = pipeline().await;
        let IngestOutcome::Published { transaction_id, partition, .. } = pipeline.ingest(raw("e1")).await.unwrap() else {
            panic!("expected publish");
        };
        let claim = pipeline.wal().try_claim(&transaction_id).unwrap();

        let delivery = pipeline.broker().try_fetch(partition).unwrap();
        let outcome = pipeline.process_delivery(delivery).await;
        assert!(matches!(outcome, DeliveryOutcome::Requeued { .. }));
        assert_eq!(pipeline.broker().queued(), 1);

        drop(claim);
        pipeline.drain().await;
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restore_requires_payload() {
        let pool = init_memory_database().await.unwrap();
        let mut config = TomlConfig::default();
        config.audit.store_raw_payload = false;
        let pipeline = Pipeline::new(&config, pool.clone(), pool);

        pipeline.ingest(raw("e1")).await.unwrap();
        pipeline.ingest(raw("e2")).await.unwrap();
        pipeline.drain().await;

        let entries = pipeline.audit().list(&Default::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            pipeline.restore(entries[0].id, "alice", None, RestorePolicy::AllowCoexistence).await,
            Err(Error::InvalidInput(_))
        ));
    }
}

//! Dead-letter lifecycle with a store that can be switched off

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use playtrack_common::config::TomlConfig;
use playtrack_common::db::init_memory_database;
use playtrack_common::models::{
    AuditStatus, DedupeLayer, FailedEventStatus, FailureLayer, PlaybackEvent, RawEvent, RestorePolicy, WalState,
};
use playtrack_common::Error;
use playtrack_ingest::audit::AuditFilter;
use playtrack_ingest::dead_letter::FailedEventFilter;
use playtrack_ingest::retry_scheduler::RetryScheduler;
use playtrack_ingest::storage::{EventStore, InsertOutcome, SqliteEventStore, StoreError};
use playtrack_ingest::{AdminService, DeliveryOutcome, IngestOutcome, Pipeline};
use uuid::Uuid;

/// Delegates to SQLite while `up`, fails every insert otherwise
struct FlakyStore {
    inner: SqliteEventStore,
    up: AtomicBool,
    insert_calls: AtomicU32,
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn insert_if_absent(&self, event: &PlaybackEvent) -> Result<InsertOutcome, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if !self.up.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("database is locked".to_string()));
        }
        self.inner.insert_if_absent(event).await
    }

    async fn find_by_transaction(&self, transaction_id: &str) -> Result<Option<PlaybackEvent>, StoreError> {
        self.inner.find_by_transaction(transaction_id).await
    }

    async fn find_by_correlation_key(&self, correlation_key: &str) -> Result<Option<PlaybackEvent>, StoreError> {
        self.inner.find_by_correlation_key(correlation_key).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<PlaybackEvent>, StoreError> {
        self.inner.get(id).await
    }

    async fn count(&self) -> Result<i64, StoreError> {
        self.inner.count().await
    }
}

struct Harness {
    pipeline: Arc<Pipeline>,
    store: Arc<FlakyStore>,
}

async fn harness(max_retries: u32) -> Harness {
    let pool = init_memory_database().await.unwrap();
    let mut config = TomlConfig::default();
    config.dead_letter.max_retries = max_retries;
    config.storage.max_attempts = 2;
    config.storage.initial_backoff_ms = 1;
    config.storage.max_backoff_ms = 2;

    let store = Arc::new(FlakyStore {
        inner: SqliteEventStore::new(pool.clone()),
        up: AtomicBool::new(false),
        insert_calls: AtomicU32::new(0),
    });
    let dyn_store: Arc<dyn EventStore> = store.clone();
    let pipeline = Arc::new(Pipeline::with_store(&config, dyn_store, pool.clone(), pool));
    Harness { pipeline, store }
}

fn event() -> RawEvent {
    RawEvent {
        event_id: "ev-1".to_string(),
        source: "emby".to_string(),
        user_id: Some(11),
        rating_key: Some("77".to_string()),
        machine_id: Some("phone".to_string()),
        timestamp: Some(
            DateTime::parse_from_rfc3339("2025-02-01T08:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ),
        ..Default::default()
    }
}

async fn only_failed(pipeline: &Pipeline) -> playtrack_common::models::FailedEvent {
    let mut all = pipeline.dead_letter().list(&FailedEventFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1, "expected exactly one dead-letter record");
    all.remove(0)
}

#[tokio::test]
async fn test_exhausted_storage_dead_letters_and_abandons_wal() {
    let h = harness(3).await;
    let IngestOutcome::Published { transaction_id, partition, .. } = h.pipeline.ingest(event()).await.unwrap() else {
        panic!("expected publish");
    };

    let delivery = h.pipeline.broker().try_fetch(partition).unwrap();
    let outcome = h.pipeline.process_delivery(delivery).await;
    assert!(matches!(
        outcome,
        DeliveryOutcome::DeadLettered { layer: FailureLayer::DuckdbInsert, .. }
    ));
    assert_eq!(h.store.insert_calls.load(Ordering::SeqCst), 2);
    assert!(h.pipeline.broker().is_idle());

    let failed = only_failed(&h.pipeline).await;
    assert_eq!(failed.transaction_id, transaction_id);
    assert_eq!(failed.status, FailedEventStatus::Pending);
    assert_eq!(failed.retry_count, 0);
    assert!(failed.last_error.contains("database is locked"));
    assert_eq!(
        h.pipeline.wal().get(&transaction_id).await.unwrap().unwrap().state,
        WalState::Abandoned
    );
}

#[tokio::test]
async fn test_retry_budget_exhaustion_requires_operator() {
    let h = harness(2).await;
    h.pipeline.ingest(event()).await.unwrap();
    h.pipeline.drain().await;

    let scheduler = RetryScheduler::new(Duration::from_secs(60), Duration::ZERO);
    for expected_count in 1..=2 {
        let report = scheduler.run_once(&h.pipeline).await.unwrap();
        assert_eq!(report.resubmitted, 1);
        h.pipeline.drain().await;
        assert_eq!(only_failed(&h.pipeline).await.retry_count, expected_count);
    }

    let failed = only_failed(&h.pipeline).await;
    assert!(failed.max_retries_exceeded);
    assert_eq!(failed.status, FailedEventStatus::Abandoned);
    assert_eq!(scheduler.run_once(&h.pipeline).await.unwrap().due, 0);
    assert_eq!(h.pipeline.store().count().await.unwrap(), 0);

    // Further automatic or manual retries are refused
    let admin = AdminService::new(Arc::clone(&h.pipeline));
    assert!(matches!(admin.retry_failed(failed.id).await, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn test_retry_after_recovery_stores_and_resolves() {
    let h = harness(5).await;
    h.pipeline.ingest(event()).await.unwrap();
    h.pipeline.drain().await;
    let failed = only_failed(&h.pipeline).await;

    h.store.up.store(true, Ordering::SeqCst);
    let admin = AdminService::new(Arc::clone(&h.pipeline));
    assert!(matches!(
        admin.retry_failed(failed.id).await.unwrap(),
        IngestOutcome::Published { .. }
    ));
    h.pipeline.drain().await;

    assert_eq!(h.pipeline.store().count().await.unwrap(), 1);
    let failed = admin.get_failed(failed.id).await.unwrap();
    assert_eq!(failed.status, FailedEventStatus::Resolved);
    assert_eq!(failed.resolved_by.as_deref(), Some("pipeline"));
    assert_eq!(failed.retry_count, 1);
}

#[tokio::test]
async fn test_operator_abandon_is_final() {
    let h = harness(5).await;
    h.pipeline.ingest(event()).await.unwrap();
    h.pipeline.drain().await;
    let failed = only_failed(&h.pipeline).await;

    let admin = AdminService::new(Arc::clone(&h.pipeline));
    let abandoned = admin
        .abandon_failed(failed.id, "ops", Some("source re-sent it"))
        .await
        .unwrap();
    assert_eq!(abandoned.status, FailedEventStatus::Abandoned);
    assert_eq!(abandoned.resolved_by.as_deref(), Some("ops"));

    let scheduler = RetryScheduler::new(Duration::from_secs(60), Duration::ZERO);
    assert_eq!(scheduler.run_once(&h.pipeline).await.unwrap().due, 0);
}

#[tokio::test]
async fn test_invalid_event_is_never_retried() {
    let h = harness(5).await;
    let mut bad = event();
    bad.timestamp = None;

    let IngestOutcome::Rejected { failed_event_id, .. } = h.pipeline.ingest(bad).await.unwrap() else {
        panic!("expected rejection");
    };
    let failed = h.pipeline.dead_letter().require(failed_event_id).await.unwrap();
    assert_eq!(failed.failure_layer, FailureLayer::Validation);
    assert_eq!(failed.status, FailedEventStatus::Abandoned);

    let scheduler = RetryScheduler::new(Duration::from_secs(60), Duration::ZERO);
    assert_eq!(scheduler.run_once(&h.pipeline).await.unwrap().due, 0);
    assert_eq!(h.store.insert_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_restore_is_retried_as_a_restore() {
    let h = harness(5).await;
    h.store.up.store(true, Ordering::SeqCst);
    let mut second = event();
    second.event_id = "ev-2".to_string();
    h.pipeline.ingest(event()).await.unwrap();
    h.pipeline.ingest(second).await.unwrap();
    h.pipeline.drain().await;
    let admin = AdminService::new(Arc::clone(&h.pipeline));
    let entry = admin.list_audit(&AuditFilter::default()).await.unwrap().remove(0);

    // Storage goes away while the restore is applied
    h.store.up.store(false, Ordering::SeqCst);
    let outcome = admin
        .restore(entry.id, "reviewer", None, RestorePolicy::AllowCoexistence)
        .await
        .unwrap();
    h.pipeline.drain().await;
    let failed = only_failed(&h.pipeline).await;
    assert_eq!(failed.transaction_id, outcome.transaction_id);
    assert_eq!(failed.restored_from_audit, Some(entry.id));
    assert_eq!(failed.restore_policy, Some(RestorePolicy::AllowCoexistence));
    assert_eq!(failed.correlation_key.as_deref(), Some(outcome.correlation_key.as_str()));

    h.store.up.store(true, Ordering::SeqCst);
    let scheduler = RetryScheduler::new(Duration::from_secs(60), Duration::ZERO);
    assert_eq!(scheduler.run_once(&h.pipeline).await.unwrap().resubmitted, 1);
    h.pipeline.drain().await;

    assert_eq!(h.pipeline.store().count().await.unwrap(), 2);
    let restored = h.pipeline.store().get(failed.record_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(restored.event_id, "ev-2");
    assert_eq!(restored.correlation_key, entry.discarded_correlation_key);
    assert_eq!(restored.restored_from_audit, Some(entry.id));

    let failed = admin.get_failed(failed.id).await.unwrap();
    assert_eq!(failed.status, FailedEventStatus::Resolved);
    let entry = h.pipeline.audit().require(entry.id).await.unwrap();
    assert_eq!(entry.status, AuditStatus::UserRestored);
    assert_eq!(entry.restored_transaction_id.as_deref(), Some(restored.transaction_id.as_str()));
    assert_eq!(h.pipeline.audit().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_is_judged_against_stored_records_only() {
    let h = harness(5).await;
    h.pipeline.ingest(event()).await.unwrap();
    h.pipeline.drain().await;
    let failed = only_failed(&h.pipeline).await;
    let first_record_id = failed.record_id.unwrap();

    // A second report reaches L1 but is still in flight when the retry runs
    h.store.up.store(true, Ordering::SeqCst);
    let mut second = event();
    second.event_id = "ev-2".to_string();
    let IngestOutcome::Published { partition, .. } = h.pipeline.ingest(second).await.unwrap() else {
        panic!("expected publish");
    };
    let in_flight = h.pipeline.broker().try_fetch(partition).unwrap();
    assert!(h.pipeline.screen(&in_flight.envelope).await.unwrap().is_none());

    let admin = AdminService::new(Arc::clone(&h.pipeline));
    admin.retry_failed(failed.id).await.unwrap();
    h.pipeline.drain().await;
    assert_eq!(admin.get_failed(failed.id).await.unwrap().status, FailedEventStatus::Resolved);
    let stored = h.pipeline.store().get(first_record_id).await.unwrap().unwrap();
    assert_eq!(stored.event_id, "ev-1");

    let outcome = h.pipeline.process_delivery(in_flight).await;
    assert!(matches!(
        outcome,
        DeliveryOutcome::Duplicate { layer: DedupeLayer::DbUnique, kept_record_id: Some(id), .. } if id == first_record_id
    ));
    assert_eq!(h.pipeline.store().count().await.unwrap(), 1);
    let entries = h.pipeline.audit().list(&AuditFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].discarded_event_id, "ev-2");
    assert_eq!(entries[0].matched_event_id, Some(first_record_id));
}

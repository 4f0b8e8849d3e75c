//! End-to-end dedup behaviour through the public pipeline API

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use playtrack_common::config::TomlConfig;
use playtrack_common::db::{init_database, init_memory_database, init_wal_database};
use playtrack_common::models::{AuditStatus, DedupeLayer, DedupeReason, RawEvent};
use playtrack_ingest::audit::AuditFilter;
use playtrack_ingest::{DeliveryOutcome, IngestOutcome, Pipeline, WorkerPool};
use tempfile::TempDir;

fn played_at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:10Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn plex_event(event_id: &str) -> RawEvent {
    RawEvent {
        event_id: event_id.to_string(),
        source: "plex".to_string(),
        server_id: Some("srv1".to_string()),
        user_id: Some(42),
        rating_key: Some("100".to_string()),
        machine_id: Some("dev7".to_string()),
        timestamp: Some(played_at()),
        play_duration_secs: Some(1_800),
        ..Default::default()
    }
}

async fn memory_pipeline() -> Pipeline {
    let pool = init_memory_database().await.unwrap();
    let mut config = TomlConfig::default();
    config.workers.count = 2;
    Pipeline::new(&config, pool.clone(), pool)
}

#[tokio::test]
async fn test_two_reports_of_one_playback_keep_the_first() {
    let pipeline = memory_pipeline().await;

    let first = pipeline.ingest(plex_event("t1")).await.unwrap();
    let IngestOutcome::Published { correlation_key, .. } = first else {
        panic!("expected publish, got {:?}", first);
    };
    assert_eq!(correlation_key, "plex:srv1:42:100:dev7:2025-01-01T00:00");

    pipeline.ingest(plex_event("t2")).await.unwrap();
    assert_eq!(pipeline.drain().await, 2);

    assert_eq!(pipeline.store().count().await.unwrap(), 1);
    let kept = pipeline
        .store()
        .find_by_correlation_key(&correlation_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(kept.event_id, "t1");

    let entries = pipeline.audit().list(&AuditFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.discarded_event_id, "t2");
    assert_eq!(entry.dedupe_reason, DedupeReason::CorrelationKey);
    assert_eq!(entry.dedupe_layer, DedupeLayer::Cache);
    assert_eq!(entry.status, AuditStatus::AutoDedupe);
    assert_eq!(entry.matched_event_id, Some(kept.id));
}

#[tokio::test]
async fn test_exactly_one_row_per_correlation_key() {
    let pipeline = memory_pipeline().await;
    for event_id in ["a", "b", "c"] {
        pipeline.ingest(plex_event(event_id)).await.unwrap();
    }
    pipeline.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 1);
    let kept = pipeline
        .store()
        .find_by_correlation_key("plex:srv1:42:100:dev7:2025-01-01T00:00")
        .await
        .unwrap()
        .unwrap();

    let entries = pipeline.audit().list(&AuditFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.matched_event_id == Some(kept.id)));
}

#[tokio::test]
async fn test_replaying_one_transaction_is_idempotent() {
    let pipeline = memory_pipeline().await;
    let event = plex_event("t1");

    for _ in 0..5 {
        pipeline.ingest(event.clone()).await.unwrap();
    }
    pipeline.drain().await;

    pipeline.broker().redeliver_unacked();
    pipeline.ingest(event).await.unwrap();
    pipeline.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 1);
    assert_eq!(pipeline.audit().count().await.unwrap(), 0);
    assert_eq!(pipeline.stats().duplicates_broker, 5);
}

#[tokio::test]
async fn test_replay_past_broker_window_is_idempotent() {
    let pool = init_memory_database().await.unwrap();
    let mut config = TomlConfig::default();
    config.broker.dedup_window_secs = 0;
    let pipeline = Pipeline::new(&config, pool.clone(), pool);
    let event = plex_event("t1");

    for _ in 0..6 {
        assert!(matches!(
            pipeline.ingest(event.clone()).await.unwrap(),
            IngestOutcome::Published { .. }
        ));
    }
    pipeline.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 1);
    assert_eq!(pipeline.audit().count().await.unwrap(), 0);
    let stats = pipeline.stats();
    assert_eq!(stats.stored, 1);
    assert_eq!(stats.redeliveries, 5);
}

#[tokio::test]
async fn test_later_bucket_is_a_separate_playback() {
    let pipeline = memory_pipeline().await;
    pipeline.ingest(plex_event("t1")).await.unwrap();

    let mut later = plex_event("t2");
    later.timestamp = Some(played_at() + chrono::Duration::minutes(10));
    pipeline.ingest(later).await.unwrap();
    pipeline.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 2);
    assert_eq!(pipeline.audit().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_other_user_is_never_deduplicated() {
    let pipeline = memory_pipeline().await;
    pipeline.ingest(plex_event("t1")).await.unwrap();

    let mut other = plex_event("t2");
    other.user_id = Some(43);
    pipeline.ingest(other).await.unwrap();
    pipeline.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_cross_source_report_is_audited_with_similarity() {
    let pipeline = memory_pipeline().await;
    pipeline.ingest(plex_event("p1")).await.unwrap();
    pipeline.drain().await;

    let mut tautulli = plex_event("tt1");
    tautulli.source = "tautulli".to_string();
    pipeline.ingest(tautulli).await.unwrap();
    pipeline.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 1);
    let entries = pipeline
        .audit()
        .list(&AuditFilter {
            reason: Some(DedupeReason::CrossSourceKey),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].discarded_source, "tautulli");
    assert_eq!(entries[0].matched_source.as_deref(), Some("plex"));
    let similarity = entries[0].similarity_score.unwrap();
    assert!(similarity > 0.9, "similarity {}", similarity);
}

#[tokio::test]
async fn test_unknown_source_is_not_cross_source_deduplicated() {
    let pipeline = memory_pipeline().await;
    pipeline.ingest(plex_event("p1")).await.unwrap();

    let mut unknown = plex_event("x1");
    unknown.source = "homegrown".to_string();
    pipeline.ingest(unknown).await.unwrap();
    pipeline.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_store_one_row_per_playback() {
    let dir = TempDir::new().unwrap();
    let events = init_database(&dir.path().join("playtrack.db")).await.unwrap();
    let wal = init_wal_database(&dir.path().join("consumer_wal.db")).await.unwrap();
    let mut config = TomlConfig::default();
    config.workers.count = 4;
    let pipeline = Arc::new(Pipeline::new(&config, events, wal));

    let workers = WorkerPool::spawn(Arc::clone(&pipeline));
    assert_eq!(workers.len(), 4);

    // Ten distinct playbacks, each reported three times by different producers
    let mut producers = Vec::new();
    for copy in 0..3 {
        let pipeline = Arc::clone(&pipeline);
        producers.push(tokio::spawn(async move {
            for user in 1..=10 {
                let mut event = plex_event(&format!("u{}-copy{}", user, copy));
                event.user_id = Some(user);
                pipeline.ingest(event).await.unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    assert!(workers.wait_idle(Duration::from_secs(30)).await);
    workers.shutdown().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 10);
    assert_eq!(pipeline.audit().count().await.unwrap(), 20);
    let stats = pipeline.stats();
    assert_eq!(stats.stored, 10);
    assert_eq!(stats.duplicates_cache + stats.duplicates_db, 20);
}

#[tokio::test]
async fn test_redelivered_stored_transaction_is_acked_without_audit() {
    let pipeline = memory_pipeline().await;
    let IngestOutcome::Published { partition, .. } = pipeline.ingest(plex_event("t1")).await.unwrap() else {
        panic!("expected publish");
    };

    // Take the delivery and store it, but lose the ack
    let delivery = pipeline.broker().try_fetch(partition).unwrap();
    let replay = delivery.clone();
    assert!(matches!(
        pipeline.process_delivery(delivery).await,
        DeliveryOutcome::Stored { .. }
    ));

    assert_eq!(pipeline.process_delivery(replay).await, DeliveryOutcome::Redelivery);
    assert_eq!(pipeline.store().count().await.unwrap(), 1);
    assert_eq!(pipeline.audit().count().await.unwrap(), 0);
}

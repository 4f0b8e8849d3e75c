//! Operator review of discards: confirm and restore

use std::sync::Arc;

use chrono::{DateTime, Utc};
use playtrack_common::config::TomlConfig;
use playtrack_common::db::init_memory_database;
use playtrack_common::models::{AuditStatus, DedupeAuditEntry, RawEvent, RestorePolicy};
use playtrack_common::Error;
use playtrack_ingest::audit::AuditFilter;
use playtrack_ingest::{AdminService, Pipeline};

const KEY: &str = "tautulli:default:8:300:unknown:2025-05-05T10:00";

fn report(event_id: &str) -> RawEvent {
    RawEvent {
        event_id: event_id.to_string(),
        source: "tautulli".to_string(),
        user_id: Some(8),
        rating_key: Some("300".to_string()),
        title: Some("Pilot".to_string()),
        timestamp: Some(
            DateTime::parse_from_rfc3339("2025-05-05T10:01:00Z")
                .unwrap()
                .with_timezone(&Utc),
        ),
        ..Default::default()
    }
}

/// Two reports of one playback; returns the admin surface and the single discard
async fn with_discard() -> (AdminService, Arc<Pipeline>, DedupeAuditEntry) {
    let pool = init_memory_database().await.unwrap();
    let pipeline = Arc::new(Pipeline::new(&TomlConfig::default(), pool.clone(), pool));
    pipeline.ingest(report("first")).await.unwrap();
    pipeline.ingest(report("second")).await.unwrap();
    pipeline.drain().await;

    let admin = AdminService::new(Arc::clone(&pipeline));
    let mut entries = admin.list_audit(&AuditFilter::default()).await.unwrap();
    assert_eq!(entries.len(), 1);
    (admin, pipeline, entries.remove(0))
}

#[tokio::test]
async fn test_confirm_only_changes_review_state() {
    let (admin, pipeline, entry) = with_discard().await;

    let confirmed = admin.confirm(entry.id, "reviewer", Some("same play")).await.unwrap();
    assert_eq!(confirmed.status, AuditStatus::UserConfirmed);
    assert_eq!(confirmed.resolved_by.as_deref(), Some("reviewer"));
    assert_eq!(confirmed.resolution_notes.as_deref(), Some("same play"));
    assert!(confirmed.resolved_at.is_some());

    assert_eq!(confirmed.discarded_transaction_id, entry.discarded_transaction_id);
    assert_eq!(confirmed.matched_event_id, entry.matched_event_id);
    assert_eq!(confirmed.dedupe_reason, entry.dedupe_reason);
    assert_eq!(pipeline.store().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_restore_with_disambiguated_key() {
    let (admin, pipeline, entry) = with_discard().await;
    assert_eq!(entry.discarded_correlation_key, KEY);
    let kept_id = entry.matched_event_id.unwrap();
    let kept_before = pipeline.store().get(kept_id).await.unwrap().unwrap();

    let outcome = admin
        .restore(entry.id, "reviewer", Some("two viewers"), RestorePolicy::DisambiguatedKey)
        .await
        .unwrap();
    assert_eq!(outcome.entry.status, AuditStatus::UserRestored);
    assert_eq!(outcome.entry.restore_policy, Some(RestorePolicy::DisambiguatedKey));
    assert_eq!(outcome.correlation_key, format!("{}:restored:{}", KEY, entry.id));
    admin.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 2);
    let restored = pipeline
        .store()
        .find_by_transaction(&outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.event_id, "second");
    assert_eq!(restored.correlation_key, outcome.correlation_key);
    assert_eq!(restored.restored_from_audit, None);
    assert_ne!(restored.transaction_id, entry.discarded_transaction_id);

    let kept_after = pipeline.store().get(kept_id).await.unwrap().unwrap();
    assert_eq!(kept_after, kept_before);
}

#[tokio::test]
async fn test_restore_allowing_coexistence() {
    let (admin, pipeline, entry) = with_discard().await;
    let kept_id = entry.matched_event_id.unwrap();
    let kept_before = pipeline.store().get(kept_id).await.unwrap().unwrap();

    let outcome = admin
        .restore(entry.id, "reviewer", None, RestorePolicy::AllowCoexistence)
        .await
        .unwrap();
    assert_eq!(outcome.correlation_key, KEY);
    admin.drain().await;

    assert_eq!(pipeline.store().count().await.unwrap(), 2);
    let restored = pipeline
        .store()
        .find_by_transaction(&outcome.transaction_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(restored.correlation_key, KEY);
    assert_eq!(restored.restored_from_audit, Some(entry.id));

    // The live row for the key is still the one that was kept
    let live = pipeline.store().find_by_correlation_key(KEY).await.unwrap().unwrap();
    assert_eq!(live.id, kept_id);
    assert_eq!(pipeline.store().get(kept_id).await.unwrap().unwrap(), kept_before);
}

#[tokio::test]
async fn test_restore_happens_once() {
    let (admin, pipeline, entry) = with_discard().await;
    admin
        .restore(entry.id, "reviewer", None, RestorePolicy::DisambiguatedKey)
        .await
        .unwrap();
    admin.drain().await;

    let again = admin
        .restore(entry.id, "reviewer", None, RestorePolicy::AllowCoexistence)
        .await;
    assert!(matches!(again, Err(Error::Conflict(_))));
    assert!(matches!(
        admin.confirm(entry.id, "reviewer", None).await,
        Err(Error::Conflict(_))
    ));
    admin.drain().await;
    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_confirmed_discard_can_still_be_restored() {
    let (admin, pipeline, entry) = with_discard().await;
    admin.confirm(entry.id, "reviewer", None).await.unwrap();

    let outcome = admin
        .restore(entry.id, "second-reviewer", Some("changed my mind"), RestorePolicy::DisambiguatedKey)
        .await
        .unwrap();
    admin.drain().await;

    assert_eq!(outcome.entry.status, AuditStatus::UserRestored);
    assert_eq!(outcome.entry.resolved_by.as_deref(), Some("second-reviewer"));
    assert_eq!(pipeline.store().count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_restore_unknown_entry_is_not_found() {
    let (admin, _, _) = with_discard().await;
    let missing = admin
        .restore(uuid::Uuid::new_v4(), "reviewer", None, RestorePolicy::AllowCoexistence)
        .await;
    assert!(matches!(missing, Err(Error::NotFound(_))));
}

//! Dedup audit ledger
//!
//! One row per discard decision, unique per (discarded transaction, layer),
//! so a replayed delivery never grows the ledger twice. Status moves only
//! through operator actions: `auto_dedupe -> user_confirmed` or
//! `auto_dedupe | user_confirmed -> user_restored`.

use crate::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT};
use crate::delivery::Envelope;
use crate::local_dedup::KeptRef;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use playtrack_common::models::{
    AuditStatus, DedupeAuditEntry, DedupeAuditStats, DedupeLayer, DedupeReason, PlaybackEvent,
    RestorePolicy,
};
use playtrack_common::time::now;
use playtrack_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_LIST_LIMIT: u32 = 100;
pub const MAX_LIST_LIMIT: u32 = 1000;

/// Identifiers of the event that was kept
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchedRef {
    pub record_id: Option<Uuid>,
    pub transaction_id: Option<String>,
    pub correlation_key: Option<String>,
    pub source: Option<String>,
}

impl From<&KeptRef> for MatchedRef {
    fn from(kept: &KeptRef) -> Self {
        Self {
            record_id: Some(kept.record_id),
            transaction_id: Some(kept.transaction_id.clone()),
            correlation_key: Some(kept.correlation_key.clone()),
            source: Some(kept.source.clone()),
        }
    }
}

impl From<&PlaybackEvent> for MatchedRef {
    fn from(event: &PlaybackEvent) -> Self {
        Self {
            record_id: Some(event.id),
            transaction_id: Some(event.transaction_id.clone()),
            correlation_key: Some(event.correlation_key.clone()),
            source: Some(event.source.clone()),
        }
    }
}

/// A discard decision about to be written
#[derive(Debug, Clone)]
pub struct Discard<'a> {
    pub envelope: &'a Envelope,
    pub matched: MatchedRef,
    pub reason: DedupeReason,
    pub layer: DedupeLayer,
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<i64>,
    pub source: Option<String>,
    pub status: Option<AuditStatus>,
    pub reason: Option<DedupeReason>,
    pub layer: Option<DedupeLayer>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Internal(format!("bad audit uuid {}: {}", text, e)))
}

fn entry_from_row(row: &SqliteRow) -> Result<DedupeAuditEntry> {
    let id: String = row.get("id");
    let matched: Option<String> = row.get("matched_event_id");
    let reason: String = row.get("dedupe_reason");
    let layer: String = row.get("dedupe_layer");
    let status: String = row.get("status");
    let policy: Option<String> = row.get("restore_policy");

    Ok(DedupeAuditEntry {
        id: parse_uuid(&id)?,
        timestamp: row.get("timestamp"),
        discarded_event_id: row.get("discarded_event_id"),
        discarded_transaction_id: row.get("discarded_transaction_id"),
        discarded_session_key: row.get("discarded_session_key"),
        discarded_correlation_key: row.get("discarded_correlation_key"),
        discarded_source: row.get("discarded_source"),
        discarded_started_at: row.get("discarded_started_at"),
        discarded_raw_payload: row.get("discarded_raw_payload"),
        matched_event_id: matched.as_deref().map(parse_uuid).transpose()?,
        matched_transaction_id: row.get("matched_transaction_id"),
        matched_correlation_key: row.get("matched_correlation_key"),
        matched_source: row.get("matched_source"),
        dedupe_reason: reason.parse()?,
        dedupe_layer: layer.parse()?,
        similarity_score: row.get("similarity_score"),
        user_id: row.get("user_id"),
        username: row.get("username"),
        media_type: row.get("media_type"),
        title: row.get("title"),
        rating_key: row.get("rating_key"),
        status: status.parse()?,
        resolved_by: row.get("resolved_by"),
        resolved_at: row.get("resolved_at"),
        resolution_notes: row.get("resolution_notes"),
        restore_policy: policy.as_deref().map(|p| p.parse::<RestorePolicy>()).transpose()?,
        restored_transaction_id: row.get("restored_transaction_id"),
        created_at: row.get("created_at"),
    })
}

#[derive(Clone)]
pub struct AuditLedger {
    pool: SqlitePool,
    store_raw_payload: bool,
}

impl AuditLedger {
    pub fn new(pool: SqlitePool, store_raw_payload: bool) -> Self {
        Self {
            pool,
            store_raw_payload,
        }
    }

    /// Write a discard decision.
    ///
    /// Returns the entry and whether it was created by this call. A second
    /// discard of the same transaction at the same layer returns the first.
    pub async fn record(&self, discard: Discard<'_>) -> Result<(DedupeAuditEntry, bool)> {
        let envelope = discard.envelope;
        let event = &envelope.event;
        let payload = if self.store_raw_payload {
            Some(serde_json::to_string(event)?)
        } else {
            None
        };
        let id = Uuid::new_v4();

        let inserted = retry_on_lock("audit record", DEFAULT_MAX_LOCK_WAIT, || async {
            let at = now();
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO dedupe_audit_log (
                    id, timestamp,
                    discarded_event_id, discarded_transaction_id, discarded_session_key,
                    discarded_correlation_key, discarded_source, discarded_started_at,
                    discarded_raw_payload,
                    matched_event_id, matched_transaction_id, matched_correlation_key, matched_source,
                    dedupe_reason, dedupe_layer, similarity_score,
                    user_id, username, media_type, title, rating_key,
                    status, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'auto_dedupe', ?)
                "#,
            )
            .bind(id.to_string())
            .bind(at)
            .bind(&event.event_id)
            .bind(&envelope.transaction_id)
            .bind(&event.session_key)
            .bind(&envelope.correlation_key)
            .bind(&event.source)
            .bind(event.effective_started_at())
            .bind(&payload)
            .bind(discard.matched.record_id.map(|id| id.to_string()))
            .bind(&discard.matched.transaction_id)
            .bind(&discard.matched.correlation_key)
            .bind(&discard.matched.source)
            .bind(discard.reason.as_str())
            .bind(discard.layer.as_str())
            .bind(discard.similarity)
            .bind(event.user_id)
            .bind(&event.username)
            .bind(&event.media_type)
            .bind(&event.title)
            .bind(&event.rating_key)
            .bind(at)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected() == 1)
        })
        .await?;

        let row = sqlx::query(
            "SELECT * FROM dedupe_audit_log WHERE discarded_transaction_id = ? AND dedupe_layer = ?",
        )
        .bind(&envelope.transaction_id)
        .bind(discard.layer.as_str())
        .fetch_one(&self.pool)
        .await?;
        let entry = entry_from_row(&row)?;

        if inserted {
            info!(
                audit_id = %entry.id,
                transaction_id = %entry.discarded_transaction_id,
                kept_transaction_id = entry.matched_transaction_id.as_deref().unwrap_or("-"),
                reason = %entry.dedupe_reason,
                layer = %entry.dedupe_layer,
                "Duplicate discarded"
            );
        } else {
            debug!(
                audit_id = %entry.id,
                transaction_id = %entry.discarded_transaction_id,
                "Discard already audited"
            );
        }
        Ok((entry, inserted))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<DedupeAuditEntry>> {
        let row = sqlx::query("SELECT * FROM dedupe_audit_log WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn require(&self, id: Uuid) -> Result<DedupeAuditEntry> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("audit entry {}", id)))
    }

    pub async fn list(&self, filter: &AuditFilter) -> Result<Vec<DedupeAuditEntry>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM dedupe_audit_log WHERE 1 = 1");
        if let Some(user_id) = filter.user_id {
            query.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(source) = &filter.source {
            query.push(" AND discarded_source = ").push_bind(source.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(reason) = filter.reason {
            query.push(" AND dedupe_reason = ").push_bind(reason.as_str());
        }
        if let Some(layer) = filter.layer {
            query.push(" AND dedupe_layer = ").push_bind(layer.as_str());
        }
        if let Some(from) = filter.from {
            query.push(" AND timestamp >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            query.push(" AND timestamp < ").push_bind(to);
        }

        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        query
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset.unwrap_or(0)));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Operator agrees the discard was correct.
    ///
    /// Confirming an already confirmed entry is a no-op; a restored entry
    /// cannot be confirmed.
    pub async fn confirm(&self, id: Uuid, actor: &str, notes: Option<&str>) -> Result<DedupeAuditEntry> {
        let at = now();
        let result = sqlx::query(
            r#"
            UPDATE dedupe_audit_log
            SET status = 'user_confirmed', resolved_by = ?, resolved_at = ?,
                resolution_notes = COALESCE(?, resolution_notes)
            WHERE id = ? AND status = 'auto_dedupe'
            "#,
        )
        .bind(actor)
        .bind(at)
        .bind(notes)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        let entry = self.require(id).await?;
        if result.rows_affected() == 0 && entry.status == AuditStatus::UserRestored {
            return Err(Error::Conflict(format!("audit entry {} was already restored", id)));
        }
        if result.rows_affected() == 1 {
            info!(audit_id = %id, actor, "Discard confirmed");
        }
        Ok(entry)
    }

    /// Move an entry to `user_restored`, recording the policy and the
    /// transaction id of the re-injected delivery
    /// Move an entry to `user_restored`.
    ///
    /// `previous` names the transaction of an earlier restore that never
    /// became durable; the entry is only taken over again while it still
    /// points at that transaction.
    pub async fn mark_restored(
        &self,
        id: Uuid,
        actor: &str,
        notes: Option<&str>,
        policy: RestorePolicy,
        restored_transaction_id: &str,
        previous: Option<&str>,
    ) -> Result<DedupeAuditEntry> {
        let at = now();
        let result = sqlx::query(
            r#"
            UPDATE dedupe_audit_log
            SET status = 'user_restored', resolved_by = ?, resolved_at = ?,
                resolution_notes = COALESCE(?, resolution_notes),
                restore_policy = ?, restored_transaction_id = ?
            WHERE id = ?
              AND (status IN ('auto_dedupe', 'user_confirmed')
                   OR (status = 'user_restored' AND restored_transaction_id = ?))
            "#,
        )
        .bind(actor)
        .bind(at)
        .bind(notes)
        .bind(policy.as_str())
        .bind(restored_transaction_id)
        .bind(id.to_string())
        .bind(previous)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish missing from already restored
            self.require(id).await?;
            return Err(Error::Conflict(format!("audit entry {} was already restored", id)));
        }

        info!(
            audit_id = %id,
            actor,
            policy = %policy,
            restored_transaction_id,
            retaken = previous.is_some(),
            "Discard restored"
        );
        self.require(id).await
    }

    /// Point a restored entry at the transaction that now carries the restore
    pub async fn set_restored_transaction(&self, id: Uuid, restored_transaction_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE dedupe_audit_log SET restored_transaction_id = ? WHERE id = ? AND status = 'user_restored'",
        )
        .bind(restored_transaction_id)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("no restored audit entry {}", id)));
        }
        debug!(audit_id = %id, restored_transaction_id, "Restore moved to new transaction");
        Ok(())
    }

    pub async fn stats(&self) -> Result<DedupeAuditStats> {
        let mut stats = DedupeAuditStats::default();

        let by_status = self.grouped("status").await?;
        stats.pending_review = by_status.get(AuditStatus::AutoDedupe.as_str()).copied().unwrap_or(0);
        stats.user_confirmed = by_status.get(AuditStatus::UserConfirmed.as_str()).copied().unwrap_or(0);
        stats.user_restored = by_status.get(AuditStatus::UserRestored.as_str()).copied().unwrap_or(0);
        stats.total_deduped = by_status.values().sum();
        stats.accuracy_rate = DedupeAuditStats::compute_accuracy(stats.user_confirmed, stats.user_restored);

        stats.by_reason = self.grouped("dedupe_reason").await?;
        stats.by_layer = self.grouped("dedupe_layer").await?;
        stats.by_source = self.grouped("discarded_source").await?;

        let at = now();
        stats.last_24_hours = self.count_since(at - ChronoDuration::hours(24)).await?;
        stats.last_7_days = self.count_since(at - ChronoDuration::days(7)).await?;
        stats.last_30_days = self.count_since(at - ChronoDuration::days(30)).await?;
        Ok(stats)
    }

    async fn grouped(&self, column: &'static str) -> Result<BTreeMap<String, i64>> {
        let sql = format!(
            "SELECT {column}, COUNT(*) FROM dedupe_audit_log GROUP BY {column}",
            column = column
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().collect())
    }

    async fn count_since(&self, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dedupe_audit_log WHERE timestamp >= ?")
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete reviewed entries older than the retention window.
    /// Unreviewed (`auto_dedupe`) entries are never deleted.
    pub async fn cleanup(&self, retention_days: u32) -> Result<u64> {
        let cutoff = now() - ChronoDuration::days(i64::from(retention_days));
        let result = sqlx::query(
            r#"
            DELETE FROM dedupe_audit_log
            WHERE status != 'auto_dedupe' AND COALESCE(resolved_at, timestamp) < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, retention_days, "Audit retention cleanup");
        }
        Ok(deleted)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dedupe_audit_log")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

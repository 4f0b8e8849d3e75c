//! Dead-letter store for events that exhausted their retry budget
//!
//! Each failed transaction gets one record holding a frozen copy of the raw
//! event. The retry scheduler re-submits `pending`/`retrying` records as
//! fresh deliveries; once `retry_count` reaches `max_retries` the record is
//! flagged `max_retries_exceeded` and `abandoned`, and only an operator can
//! close it.

use crate::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use playtrack_common::models::{FailedEvent, FailedEventStatus, FailureLayer, RawEvent, RestorePolicy};
use playtrack_common::time::now;
use playtrack_common::{Error, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

/// Everything needed to open a dead-letter record
#[derive(Debug, Clone)]
pub struct NewFailedEvent {
    pub transaction_id: String,
    pub correlation_key: Option<String>,
    /// Record id of the failed delivery, reused when it is re-submitted
    pub record_id: Option<Uuid>,
    /// Audit entry and policy when the failed delivery was a restore
    pub restore: Option<(Uuid, RestorePolicy)>,
    pub event: RawEvent,
    pub failure_layer: FailureLayer,
    pub failure_reason: String,
    pub last_error: String,
}

#[derive(Debug, Clone, Default)]
pub struct FailedEventFilter {
    pub status: Option<FailedEventStatus>,
    pub layer: Option<FailureLayer>,
    pub source: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailedEventCounts {
    pub pending: i64,
    pub retrying: i64,
    pub resolved: i64,
    pub abandoned: i64,
    pub max_retries_exceeded: i64,
}

impl FailedEventCounts {
    /// Records still awaiting retry or operator action
    pub fn open(&self) -> i64 {
        self.pending + self.retrying + self.abandoned
    }
}

fn parse_id(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|e| Error::Internal(format!("bad failed event id {}: {}", text, e)))
}

fn failed_event_from_row(row: &SqliteRow) -> Result<FailedEvent> {
    let id: String = row.get("id");
    let record_id: Option<String> = row.get("record_id");
    let restored_from: Option<String> = row.get("restored_from_audit");
    let restore_policy: Option<String> = row.get("restore_policy");
    let layer: String = row.get("failure_layer");
    let status: String = row.get("status");
    let retry_count: i64 = row.get("retry_count");
    let exceeded: i64 = row.get("max_retries_exceeded");

    Ok(FailedEvent {
        id: parse_id(&id)?,
        transaction_id: row.get("transaction_id"),
        event_id: row.get("event_id"),
        session_key: row.get("session_key"),
        correlation_key: row.get("correlation_key"),
        source: row.get("source"),
        record_id: record_id.as_deref().map(parse_id).transpose()?,
        restored_from_audit: restored_from.as_deref().map(parse_id).transpose()?,
        restore_policy: restore_policy.map(|p| p.parse::<RestorePolicy>()).transpose()?,
        event_payload: row.get("event_payload"),
        failed_at: row.get("failed_at"),
        failure_reason: row.get("failure_reason"),
        failure_layer: layer.parse()?,
        last_error: row.get("last_error"),
        retry_count: retry_count.max(0) as u32,
        last_retry_at: row.get("last_retry_at"),
        max_retries_exceeded: exceeded != 0,
        status: status.parse()?,
        resolved_at: row.get("resolved_at"),
        resolved_by: row.get("resolved_by"),
        resolution_notes: row.get("resolution_notes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[derive(Clone)]
pub struct DeadLetterStore {
    pool: SqlitePool,
    max_retries: u32,
}

impl DeadLetterStore {
    pub fn new(pool: SqlitePool, max_retries: u32) -> Self {
        Self {
            pool,
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Open a record for a failed transaction.
    ///
    /// Idempotent per transaction id: recording the same transaction again
    /// returns the existing record. Validation failures are created
    /// `abandoned`, since retrying malformed input cannot succeed.
    pub async fn record(&self, failure: NewFailedEvent) -> Result<FailedEvent> {
        let payload = serde_json::to_string(&failure.event)?;
        let status = match failure.failure_layer {
            FailureLayer::Validation => FailedEventStatus::Abandoned,
            _ => FailedEventStatus::Pending,
        };
        let id = Uuid::new_v4();

        retry_on_lock("dead_letter record", DEFAULT_MAX_LOCK_WAIT, || async {
            let at = now();
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO failed_events (
                    id, transaction_id, event_id, session_key, correlation_key, source,
                    record_id, restored_from_audit, restore_policy,
                    event_payload, failed_at, failure_reason, failure_layer, last_error,
                    retry_count, max_retries_exceeded, status, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(&failure.transaction_id)
            .bind(&failure.event.event_id)
            .bind(&failure.event.session_key)
            .bind(&failure.correlation_key)
            .bind(&failure.event.source)
            .bind(failure.record_id.map(|id| id.to_string()))
            .bind(failure.restore.map(|(audit_id, _)| audit_id.to_string()))
            .bind(failure.restore.map(|(_, policy)| policy.as_str()))
            .bind(&payload)
            .bind(at)
            .bind(&failure.failure_reason)
            .bind(failure.failure_layer.as_str())
            .bind(&failure.last_error)
            .bind(status.as_str())
            .bind(at)
            .bind(at)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await?;

        let record = self
            .find_by_transaction(&failure.transaction_id)
            .await?
            .ok_or_else(|| Error::Internal(format!(
                "dead-letter record for {} missing after insert",
                failure.transaction_id
            )))?;

        warn!(
            failed_event_id = %record.id,
            transaction_id = %record.transaction_id,
            layer = %record.failure_layer,
            error = %record.last_error,
            "Event dead-lettered"
        );
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<FailedEvent>> {
        let row = sqlx::query("SELECT * FROM failed_events WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(failed_event_from_row).transpose()
    }

    pub async fn require(&self, id: Uuid) -> Result<FailedEvent> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("failed event {}", id)))
    }

    pub async fn find_by_transaction(&self, transaction_id: &str) -> Result<Option<FailedEvent>> {
        let row = sqlx::query("SELECT * FROM failed_events WHERE transaction_id = ?")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(failed_event_from_row).transpose()
    }

    pub async fn list(&self, filter: &FailedEventFilter) -> Result<Vec<FailedEvent>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM failed_events WHERE 1 = 1");
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(layer) = filter.layer {
            query.push(" AND failure_layer = ").push_bind(layer.as_str());
        }
        if let Some(source) = &filter.source {
            query.push(" AND source = ").push_bind(source.clone());
        }
        query
            .push(" ORDER BY failed_at DESC LIMIT ")
            .push_bind(i64::from(filter.limit.unwrap_or(100).min(1000)))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset.unwrap_or(0)));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(failed_event_from_row).collect()
    }

    /// Records the scheduler may re-submit at `at`.
    ///
    /// A record is due once `retry_count * backoff` (capped at one hour) has
    /// passed since its last retry. Validation failures are never due.
    pub async fn due_for_retry(&self, at: DateTime<Utc>, backoff: ChronoDuration) -> Result<Vec<FailedEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM failed_events
            WHERE status IN ('pending', 'retrying')
              AND max_retries_exceeded = 0
              AND failure_layer != 'validation'
            ORDER BY failed_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let cap = ChronoDuration::hours(1);
        let mut due = Vec::new();
        for row in &rows {
            let record = failed_event_from_row(row)?;
            let ready = match record.last_retry_at {
                None => true,
                Some(last) => {
                    let wait = (backoff * record.retry_count as i32).min(cap);
                    at - last >= wait
                }
            };
            if ready {
                due.push(record);
            }
        }
        Ok(due)
    }

    /// Mark a record as being retried, bumping its retry counter
    pub async fn begin_retry(&self, id: Uuid) -> Result<FailedEvent> {
        let at = now();
        let result = sqlx::query(
            r#"
            UPDATE failed_events
            SET status = 'retrying', retry_count = retry_count + 1,
                last_retry_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('pending', 'retrying') AND max_retries_exceeded = 0
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.require(id).await?;
            return Err(Error::Conflict(format!(
                "failed event {} cannot be retried from status {}",
                id, current.status
            )));
        }
        self.require(id).await
    }

    /// Record that a retry failed again; abandons once the budget is spent
    pub async fn record_retry_failure(&self, id: Uuid, error: &str) -> Result<FailedEvent> {
        retry_on_lock("dead_letter retry_failure", DEFAULT_MAX_LOCK_WAIT, || async {
            sqlx::query(
                r#"
                UPDATE failed_events
                SET last_error = ?,
                    failed_at = ?,
                    max_retries_exceeded = CASE WHEN retry_count >= ? THEN 1 ELSE 0 END,
                    status = CASE WHEN retry_count >= ? THEN 'abandoned' ELSE 'retrying' END,
                    updated_at = ?
                WHERE id = ? AND status NOT IN ('resolved', 'abandoned')
                "#,
            )
            .bind(error)
            .bind(now())
            .bind(i64::from(self.max_retries))
            .bind(i64::from(self.max_retries))
            .bind(now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await?;

        let record = self.require(id).await?;
        if record.max_retries_exceeded {
            warn!(
                failed_event_id = %id,
                retry_count = record.retry_count,
                "Retry budget exhausted, operator action required"
            );
        }
        Ok(record)
    }

    /// Close a record after a successful late insert or operator review
    pub async fn mark_resolved(&self, id: Uuid, resolved_by: &str, notes: Option<&str>) -> Result<FailedEvent> {
        self.close(id, FailedEventStatus::Resolved, resolved_by, notes).await
    }

    /// Operator gives up on a record
    pub async fn abandon(&self, id: Uuid, resolved_by: &str, notes: Option<&str>) -> Result<FailedEvent> {
        self.close(id, FailedEventStatus::Abandoned, resolved_by, notes).await
    }

    async fn close(
        &self,
        id: Uuid,
        status: FailedEventStatus,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<FailedEvent> {
        let at = now();
        let result = sqlx::query(
            r#"
            UPDATE failed_events
            SET status = ?, resolved_at = ?, resolved_by = ?,
                resolution_notes = COALESCE(?, resolution_notes), updated_at = ?
            WHERE id = ? AND status != 'resolved'
            "#,
        )
        .bind(status.as_str())
        .bind(at)
        .bind(resolved_by)
        .bind(notes)
        .bind(at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.require(id).await?;
            return Err(Error::Conflict(format!(
                "failed event {} is already {}",
                id, current.status
            )));
        }

        info!(failed_event_id = %id, status = %status, resolved_by, "Failed event closed");
        self.require(id).await
    }

    pub async fn counts(&self) -> Result<FailedEventCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM failed_events GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = FailedEventCounts::default();
        for (status, count) in rows {
            match status.parse::<FailedEventStatus>()? {
                FailedEventStatus::Pending => counts.pending = count,
                FailedEventStatus::Retrying => counts.retrying = count,
                FailedEventStatus::Resolved => counts.resolved = count,
                FailedEventStatus::Abandoned => counts.abandoned = count,
            }
        }
        counts.max_retries_exceeded =
            sqlx::query_scalar("SELECT COUNT(*) FROM failed_events WHERE max_retries_exceeded = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(counts)
    }
}

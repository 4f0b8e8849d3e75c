//! Canonical event store (L3)
//!
//! `insert_if_absent` either inserts or reports the row already occupying the
//! transaction id or correlation key. Both outcomes are success. Everything
//! else is a [`StoreError`], split into validation problems (pointless to
//! retry) and availability problems (retried with backoff by the writer).

use async_trait::async_trait;
use playtrack_common::models::PlaybackEvent;
use sqlx::error::ErrorKind;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            match db_err.kind() {
                ErrorKind::NotNullViolation | ErrorKind::CheckViolation => {
                    return StoreError::Validation(db_err.to_string());
                }
                _ => {}
            }
        }
        if let sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) = &err {
            return StoreError::Validation(err.to_string());
        }
        StoreError::Unavailable(err.to_string())
    }
}

impl From<StoreError> for playtrack_common::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => playtrack_common::Error::InvalidInput(msg),
            StoreError::Unavailable(msg) => playtrack_common::Error::Internal(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// A row already holds this transaction id or correlation key
    AlreadyPresent {
        existing: PlaybackEvent,
        /// The existing row came from this very transaction (a replay)
        same_transaction: bool,
    },
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_if_absent(&self, event: &PlaybackEvent) -> Result<InsertOutcome, StoreError>;

    async fn find_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PlaybackEvent>, StoreError>;

    /// The live (not restored) row for a correlation key
    async fn find_by_correlation_key(
        &self,
        correlation_key: &str,
    ) -> Result<Option<PlaybackEvent>, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<PlaybackEvent>, StoreError>;

    async fn count(&self) -> Result<i64, StoreError>;
}

#[derive(Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

fn parse_uuid(text: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(text).map_err(|e| StoreError::Validation(format!("bad uuid {}: {}", text, e)))
}

fn event_from_row(row: &SqliteRow) -> Result<PlaybackEvent, StoreError> {
    let id: String = row.try_get("id")?;
    let restored: Option<String> = row.try_get("restored_from_audit")?;

    Ok(PlaybackEvent {
        id: parse_uuid(&id)?,
        event_id: row.try_get("event_id")?,
        source: row.try_get("source")?,
        server_id: row.try_get("server_id")?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        rating_key: row.try_get("rating_key")?,
        title: row.try_get("title")?,
        media_type: row.try_get("media_type")?,
        machine_id: row.try_get("machine_id")?,
        session_key: row.try_get("session_key")?,
        event_timestamp: row.try_get("event_timestamp")?,
        started_at: row.try_get("started_at")?,
        stopped_at: row.try_get("stopped_at")?,
        percent_complete: row.try_get("percent_complete")?,
        play_duration_secs: row.try_get("play_duration_secs")?,
        platform: row.try_get("platform")?,
        player: row.try_get("player")?,
        ip_address: row.try_get("ip_address")?,
        correlation_key: row.try_get("correlation_key")?,
        transaction_id: row.try_get("transaction_id")?,
        restored_from_audit: restored.as_deref().map(parse_uuid).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn find_conflicting(&self, event: &PlaybackEvent) -> Result<Option<PlaybackEvent>, StoreError> {
        if let Some(existing) = self.find_by_transaction(&event.transaction_id).await? {
            return Ok(Some(existing));
        }
        if event.restored_from_audit.is_none() {
            return self.find_by_correlation_key(&event.correlation_key).await;
        }
        Ok(None)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn insert_if_absent(&self, event: &PlaybackEvent) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO playback_events (
                id, event_id, source, server_id, user_id, username, rating_key, title,
                media_type, machine_id, session_key, event_timestamp, started_at, stopped_at,
                percent_complete, play_duration_secs, platform, player, ip_address,
                correlation_key, transaction_id, restored_from_audit, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.event_id)
        .bind(&event.source)
        .bind(&event.server_id)
        .bind(event.user_id)
        .bind(&event.username)
        .bind(&event.rating_key)
        .bind(&event.title)
        .bind(&event.media_type)
        .bind(&event.machine_id)
        .bind(&event.session_key)
        .bind(event.event_timestamp)
        .bind(event.started_at)
        .bind(event.stopped_at)
        .bind(event.percent_complete)
        .bind(event.play_duration_secs)
        .bind(&event.platform)
        .bind(&event.player)
        .bind(&event.ip_address)
        .bind(&event.correlation_key)
        .bind(&event.transaction_id)
        .bind(event.restored_from_audit.map(|id| id.to_string()))
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        match self.find_conflicting(event).await? {
            Some(existing) => {
                let same_transaction = existing.transaction_id == event.transaction_id;
                Ok(InsertOutcome::AlreadyPresent {
                    existing,
                    same_transaction,
                })
            }
            // OR IGNORE also swallows NOT NULL and CHECK failures
            None => Err(StoreError::Validation(format!(
                "insert of {} ignored without a conflicting row",
                event.transaction_id
            ))),
        }
    }

    async fn find_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<PlaybackEvent>, StoreError> {
        let row = sqlx::query("SELECT * FROM playback_events WHERE transaction_id = ?")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_by_correlation_key(
        &self,
        correlation_key: &str,
    ) -> Result<Option<PlaybackEvent>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM playback_events WHERE correlation_key = ? AND restored_from_audit IS NULL",
        )
        .bind(correlation_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn get(&self, id: Uuid) -> Result<Option<PlaybackEvent>, StoreError> {
        let row = sqlx::query("SELECT * FROM playback_events WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn count(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM playback_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

//! Consumer write-ahead log
//!
//! Source of truth for "was this transaction applied". An envelope is staged
//! as `pending` before it is handed to the broker, moved to `applying` before
//! the storage write and to `applied` after it. A crash at any point leaves an
//! unapplied row that the startup scan replays with the same transaction id.
//!
//! State per transaction id:
//!
//! ```text
//! pending -> applying -> applied
//! pending -> failed -> retrying -> applied
//!                              \-> abandoned
//! ```
//!
//! Abandoned rows leave the replay set but are kept for audit.

use crate::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT};
use crate::delivery::{sha256_hex, Envelope};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use playtrack_common::models::WalState;
use playtrack_common::time::now;
use playtrack_common::{Error, Result};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalEntry {
    pub transaction_id: String,
    pub correlation_key: String,
    pub payload: String,
    pub payload_sha256: String,
    pub state: WalState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub abandoned_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl WalEntry {
    /// Decode the staged envelope, verifying its digest first
    pub fn envelope(&self) -> Result<Envelope> {
        let actual = sha256_hex(self.payload.as_bytes());
        if actual != self.payload_sha256 {
            return Err(Error::Internal(format!(
                "WAL payload digest mismatch for {}",
                self.transaction_id
            )));
        }
        Ok(Envelope::from_json(&self.payload)?)
    }
}

/// Result of `begin_write`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Entry is now `applying` (or `retrying`); `attempt` counts all attempts so far
    Started { attempt: u32 },
    AlreadyApplied,
    Abandoned,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalStats {
    pub pending: i64,
    pub applying: i64,
    pub applied: i64,
    pub failed: i64,
    pub retrying: i64,
    pub abandoned: i64,
}

impl WalStats {
    pub fn needs_replay(&self) -> i64 {
        self.pending + self.applying + self.failed + self.retrying
    }
}

/// In-process ownership of a transaction id, released on drop
pub struct WalClaim {
    claims: Arc<Mutex<HashSet<String>>>,
    transaction_id: String,
}

impl WalClaim {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }
}

impl Drop for WalClaim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.transaction_id);
    }
}

#[derive(Clone)]
pub struct ConsumerWal {
    pool: SqlitePool,
    claims: Arc<Mutex<HashSet<String>>>,
}

fn entry_from_row(row: &SqliteRow) -> Result<WalEntry> {
    let state: String = row.get("state");
    let attempts: i64 = row.get("attempts");
    Ok(WalEntry {
        transaction_id: row.get("transaction_id"),
        correlation_key: row.get("correlation_key"),
        payload: row.get("payload"),
        payload_sha256: row.get("payload_sha256"),
        state: state.parse()?,
        attempts: attempts.max(0) as u32,
        last_error: row.get("last_error"),
        abandoned_reason: row.get("abandoned_reason"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        applied_at: row.get("applied_at"),
    })
}

impl ConsumerWal {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Claim a transaction id for this process; `None` if already claimed
    pub fn try_claim(&self, transaction_id: &str) -> Option<WalClaim> {
        let mut claims = self.claims.lock();
        if !claims.insert(transaction_id.to_string()) {
            return None;
        }
        Some(WalClaim {
            claims: Arc::clone(&self.claims),
            transaction_id: transaction_id.to_string(),
        })
    }

    pub fn is_claimed(&self, transaction_id: &str) -> bool {
        self.claims.lock().contains(transaction_id)
    }

    /// Durably stage an envelope as `pending` before it is published.
    ///
    /// Returns false when the transaction id is already known; the existing
    /// row is left as it is.
    pub async fn stage(&self, envelope: &Envelope) -> Result<bool> {
        let payload = envelope.to_json()?;
        let digest = sha256_hex(payload.as_bytes());
        let txn = envelope.transaction_id.as_str();

        let result = retry_on_lock("wal stage", DEFAULT_MAX_LOCK_WAIT, || {
            let payload = payload.clone();
            let digest = digest.clone();
            async move {
                let at = now();
                let result = sqlx::query(
                    r#"
                    INSERT OR IGNORE INTO consumer_wal (
                        transaction_id, correlation_key, payload, payload_sha256,
                        state, attempts, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)
                    "#,
                )
                .bind(txn)
                .bind(&envelope.correlation_key)
                .bind(&payload)
                .bind(&digest)
                .bind(at)
                .bind(at)
                .execute(&self.pool)
                .await?;
                Ok::<_, Error>(result)
            }
        })
        .await?;

        let staged = result.rows_affected() > 0;
        debug!(transaction_id = %txn, staged, "WAL stage");
        Ok(staged)
    }

    /// Durably record that the transaction is about to be applied.
    ///
    /// A new transaction is inserted as `applying`. A known one that has not
    /// reached a terminal state gets its attempt counter bumped (`failed` and
    /// `retrying` move to `retrying`, anything else to `applying`). Terminal
    /// entries are reported without modification.
    pub async fn begin_write(&self, envelope: &Envelope) -> Result<BeginOutcome> {
        let payload = envelope.to_json()?;
        let digest = sha256_hex(payload.as_bytes());
        let txn = envelope.transaction_id.as_str();

        let updated: Option<(String, i64)> = retry_on_lock("wal begin_write", DEFAULT_MAX_LOCK_WAIT, || {
            let payload = payload.clone();
            let digest = digest.clone();
            async move {
                let at = now();
                let row: Option<(String, i64)> = sqlx::query_as(
                    r#"
                    INSERT INTO consumer_wal (
                        transaction_id, correlation_key, payload, payload_sha256,
                        state, attempts, created_at, updated_at
                    ) VALUES (?, ?, ?, ?, 'applying', 1, ?, ?)
                    ON CONFLICT(transaction_id) DO UPDATE SET
                        attempts = consumer_wal.attempts + 1,
                        state = CASE
                            WHEN consumer_wal.state IN ('failed', 'retrying') THEN 'retrying'
                            ELSE 'applying'
                        END,
                        updated_at = excluded.updated_at
                    WHERE consumer_wal.state NOT IN ('applied', 'abandoned')
                    RETURNING state, attempts
                    "#,
                )
                .bind(txn)
                .bind(&envelope.correlation_key)
                .bind(&payload)
                .bind(&digest)
                .bind(at)
                .bind(at)
                .fetch_optional(&self.pool)
                .await?;
                Ok::<_, Error>(row)
            }
        })
        .await?;

        if let Some((state, attempts)) = updated {
            debug!(transaction_id = %txn, state = %state, attempts, "WAL begin_write");
            return Ok(BeginOutcome::Started {
                attempt: attempts.max(0) as u32,
            });
        }

        match self.get(txn).await?.map(|entry| entry.state) {
            Some(WalState::Applied) => Ok(BeginOutcome::AlreadyApplied),
            Some(WalState::Abandoned) => Ok(BeginOutcome::Abandoned),
            other => Err(Error::Internal(format!(
                "WAL begin_write for {} left unexpected state {:?}",
                txn, other
            ))),
        }
    }

    /// Durably record that the storage mutation succeeded
    pub async fn commit_write(&self, transaction_id: &str) -> Result<()> {
        if self.set_applied(transaction_id).await? == 0 {
            return Err(Error::NotFound(format!(
                "no committable WAL entry for {}",
                transaction_id
            )));
        }
        debug!(transaction_id, "WAL commit_write");
        Ok(())
    }

    /// Mark a transaction settled without a storage write, as for an L1
    /// discard. A transaction with no WAL entry is not an error.
    pub async fn mark_settled(&self, transaction_id: &str) -> Result<()> {
        let settled = self.set_applied(transaction_id).await?;
        debug!(transaction_id, settled, "WAL mark_settled");
        Ok(())
    }

    async fn set_applied(&self, transaction_id: &str) -> Result<u64> {
        let result = retry_on_lock("wal set_applied", DEFAULT_MAX_LOCK_WAIT, || async {
            let at = now();
            let result = sqlx::query(
                r#"
                UPDATE consumer_wal
                SET state = 'applied', applied_at = ?, updated_at = ?, last_error = NULL
                WHERE transaction_id = ? AND state != 'abandoned'
                "#,
            )
            .bind(at)
            .bind(at)
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result)
        })
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn record_failure(&self, transaction_id: &str, error: &str) -> Result<()> {
        self.set_state(transaction_id, WalState::Failed, Some(error), None)
            .await
    }

    /// Return an interrupted entry to `pending` so the next scan replays it
    pub async fn mark_pending(&self, transaction_id: &str) -> Result<()> {
        self.set_state(transaction_id, WalState::Pending, None, None).await
    }

    pub async fn mark_abandoned(&self, transaction_id: &str, reason: &str) -> Result<()> {
        self.set_state(transaction_id, WalState::Abandoned, None, Some(reason))
            .await?;
        warn!(transaction_id, reason, "WAL entry abandoned");
        Ok(())
    }

    async fn set_state(
        &self,
        transaction_id: &str,
        state: WalState,
        error: Option<&str>,
        abandoned_reason: Option<&str>,
    ) -> Result<()> {
        retry_on_lock("wal set_state", DEFAULT_MAX_LOCK_WAIT, || async {
            sqlx::query(
                r#"
                UPDATE consumer_wal
                SET state = ?,
                    last_error = COALESCE(?, last_error),
                    abandoned_reason = COALESCE(?, abandoned_reason),
                    updated_at = ?
                WHERE transaction_id = ? AND state NOT IN ('applied', 'abandoned')
                "#,
            )
            .bind(state.as_str())
            .bind(error)
            .bind(abandoned_reason)
            .bind(now())
            .bind(transaction_id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    pub async fn get(&self, transaction_id: &str) -> Result<Option<WalEntry>> {
        let row = sqlx::query("SELECT * FROM consumer_wal WHERE transaction_id = ?")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Entries the startup scan must replay, oldest first
    pub async fn pending_entries(&self) -> Result<Vec<WalEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM consumer_wal
            WHERE state IN ('pending', 'applying', 'failed', 'retrying')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn stats(&self) -> Result<WalStats> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM consumer_wal GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = WalStats::default();
        for (state, count) in rows {
            match state.parse::<WalState>()? {
                WalState::Pending => stats.pending = count,
                WalState::Applying => stats.applying = count,
                WalState::Applied => stats.applied = count,
                WalState::Failed => stats.failed = count,
                WalState::Retrying => stats.retrying = count,
                WalState::Abandoned => stats.abandoned = count,
            }
        }
        Ok(stats)
    }

    /// Delete applied entries older than `cutoff`; abandoned entries are kept
    pub async fn purge_applied(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM consumer_wal WHERE state = 'applied' AND applied_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(purged, "Purged applied WAL entries");
        }
        Ok(purged)
    }
}

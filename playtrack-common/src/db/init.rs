//! Database initialization
//!
//! Two SQLite files live under the root folder:
//! - the event store (`playback_events`, `failed_events`, `dedupe_audit_log`)
//! - the consumer write-ahead log (`consumer_wal`), opened with
//!   `synchronous = FULL` so every state transition is on disk before the
//!   call returns
//!
//! All tables are created with `CREATE TABLE IF NOT EXISTS`, so
//! initialization is idempotent and safe on every startup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Open (or create) the event store database
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let pool = open_pool(db_path, 8).await?;

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_event_store_tables(&pool).await?;

    Ok(pool)
}

/// Open (or create) the consumer WAL database
pub async fn init_wal_database(db_path: &Path) -> Result<SqlitePool> {
    let pool = open_pool(db_path, 4).await?;

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous = FULL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_consumer_wal_table(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database holding every table.
///
/// One connection keeps all callers on the same in-memory database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    create_event_store_tables(&pool).await?;
    create_consumer_wal_table(&pool).await?;

    Ok(pool)
}

async fn open_pool(db_path: &Path, max_connections: u32) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    Ok(pool)
}

/// Create every event store table and index
pub async fn create_event_store_tables(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_playback_events_table(pool).await?;
    create_failed_events_table(pool).await?;
    create_dedupe_audit_table(pool).await?;
    Ok(())
}

pub async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

/// Canonical event store.
///
/// `transaction_id` is unique so replaying a delivery is a no-op. The
/// correlation key is unique among rows that were not reinstated from the
/// audit ledger under a relaxed key.
pub async fn create_playback_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS playback_events (
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            source TEXT NOT NULL,
            server_id TEXT,
            user_id INTEGER NOT NULL,
            username TEXT,
            rating_key TEXT,
            title TEXT,
            media_type TEXT,
            machine_id TEXT,
            session_key TEXT,
            event_timestamp TIMESTAMP NOT NULL,
            started_at TIMESTAMP NOT NULL,
            stopped_at TIMESTAMP,
            percent_complete INTEGER,
            play_duration_secs INTEGER,
            platform TEXT,
            player TEXT,
            ip_address TEXT,
            correlation_key TEXT NOT NULL,
            transaction_id TEXT NOT NULL UNIQUE,
            restored_from_audit TEXT,
            created_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_playback_events_correlation_key
        ON playback_events(correlation_key)
        WHERE restored_from_audit IS NULL
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_playback_events_user ON playback_events(user_id, started_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Dead-letter store, one row per failed transaction
pub async fn create_failed_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS failed_events (
            id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL UNIQUE,
            event_id TEXT NOT NULL,
            session_key TEXT,
            correlation_key TEXT,
            source TEXT NOT NULL,
            record_id TEXT,
            restored_from_audit TEXT,
            restore_policy TEXT
                CHECK (restore_policy IS NULL
                       OR restore_policy IN ('disambiguated_key', 'allow_coexistence')),
            event_payload TEXT NOT NULL,
            failed_at TIMESTAMP NOT NULL,
            failure_reason TEXT NOT NULL,
            failure_layer TEXT NOT NULL
                CHECK (failure_layer IN ('consumer_wal', 'duckdb_insert', 'validation')),
            last_error TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_retry_at TIMESTAMP,
            max_retries_exceeded INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'retrying', 'resolved', 'abandoned')),
            resolved_at TIMESTAMP,
            resolved_by TEXT,
            resolution_notes TEXT,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_failed_events_status ON failed_events(status, failed_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Dedup audit ledger, at most one row per (discarded transaction, layer)
pub async fn create_dedupe_audit_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dedupe_audit_log (
            id TEXT PRIMARY KEY,
            timestamp TIMESTAMP NOT NULL,
            discarded_event_id TEXT NOT NULL,
            discarded_transaction_id TEXT NOT NULL,
            discarded_session_key TEXT,
            discarded_correlation_key TEXT NOT NULL,
            discarded_source TEXT NOT NULL,
            discarded_started_at TIMESTAMP,
            discarded_raw_payload TEXT,
            matched_event_id TEXT,
            matched_transaction_id TEXT,
            matched_correlation_key TEXT,
            matched_source TEXT,
            dedupe_reason TEXT NOT NULL
                CHECK (dedupe_reason IN ('event_id', 'session_key', 'correlation_key', 'cross_source_key', 'db_constraint')),
            dedupe_layer TEXT NOT NULL
                CHECK (dedupe_layer IN ('cache', 'broker', 'db_unique')),
            similarity_score REAL,
            user_id INTEGER,
            username TEXT,
            media_type TEXT,
            title TEXT,
            rating_key TEXT,
            status TEXT NOT NULL DEFAULT 'auto_dedupe'
                CHECK (status IN ('auto_dedupe', 'user_confirmed', 'user_restored')),
            resolved_by TEXT,
            resolved_at TIMESTAMP,
            resolution_notes TEXT,
            restore_policy TEXT,
            restored_transaction_id TEXT,
            created_at TIMESTAMP NOT NULL,
            UNIQUE (discarded_transaction_id, dedupe_layer)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_dedupe_audit_status ON dedupe_audit_log(status, timestamp)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Consumer write-ahead log keyed by transaction id
pub async fn create_consumer_wal_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS consumer_wal (
            transaction_id TEXT PRIMARY KEY,
            correlation_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            payload_sha256 TEXT NOT NULL,
            state TEXT NOT NULL
                CHECK (state IN ('pending', 'applying', 'applied', 'failed', 'retrying', 'abandoned')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            abandoned_reason TEXT,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            applied_at TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_consumer_wal_state ON consumer_wal(state, created_at)")
        .execute(pool)
        .await?;

    Ok(())
}

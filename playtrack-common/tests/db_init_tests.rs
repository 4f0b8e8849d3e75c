//! Database initialization tests

use playtrack_common::db::init::{init_database, init_memory_database, init_wal_database};
use sqlx::Row;
use tempfile::TempDir;

async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
    sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .fetch_all(pool)
        .await
        .unwrap()
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect()
}

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nested").join("playtrack.db");

    let result = init_database(&db_path).await;
    assert!(result.is_ok(), "Database initialization failed: {:?}", result.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("playtrack.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
}

#[tokio::test]
async fn test_event_store_tables_created() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("playtrack.db")).await.unwrap();

    let tables = table_names(&pool).await;
    for expected in ["dedupe_audit_log", "failed_events", "playback_events", "schema_version"] {
        assert!(tables.contains(&expected.to_string()), "missing table {}", expected);
    }
    assert!(!tables.contains(&"consumer_wal".to_string()));
}

#[tokio::test]
async fn test_wal_database_is_separate_and_synchronous_full() {
    let dir = TempDir::new().unwrap();
    let pool = init_wal_database(&dir.path().join("consumer_wal.db")).await.unwrap();

    let tables = table_names(&pool).await;
    assert_eq!(tables, vec!["consumer_wal".to_string()]);

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_correlation_key_unique_except_restored_rows() {
    let pool = init_memory_database().await.unwrap();

    let insert = |id: &'static str, txn: &'static str, restored: Option<&'static str>| {
        let pool = pool.clone();
        async move {
            sqlx::query(
                r#"
                INSERT INTO playback_events (
                    id, event_id, source, user_id, event_timestamp, started_at,
                    correlation_key, transaction_id, restored_from_audit, created_at
                ) VALUES (?, 'e', 'plex', 1, '2025-01-01T00:00:00+00:00',
                          '2025-01-01T00:00:00+00:00', 'plex:k', ?, ?, '2025-01-01T00:00:00+00:00')
                "#,
            )
            .bind(id)
            .bind(txn)
            .bind(restored)
            .execute(&pool)
            .await
        }
    };

    assert!(insert("a", "t1", None).await.is_ok());
    assert!(insert("b", "t2", None).await.is_err(), "second live row with same key must fail");
    assert!(insert("c", "t3", Some("audit-1")).await.is_ok(), "restored row may share the key");
    assert!(insert("d", "t1", Some("audit-2")).await.is_err(), "transaction id stays unique");
}

#[tokio::test]
async fn test_initialization_is_idempotent() {
    let pool = init_memory_database().await.unwrap();
    playtrack_common::db::create_event_store_tables(&pool).await.unwrap();
    playtrack_common::db::create_consumer_wal_table(&pool).await.unwrap();

    let versions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(versions, 1);
}

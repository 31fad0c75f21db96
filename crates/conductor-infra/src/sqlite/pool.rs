//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. This module provides a `DatabasePool`
//! with a multi-connection reader pool for concurrent reads and a single-connection
//! writer pool for serialized writes. Both use WAL journal mode and enforce foreign keys.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
///   Lease acquisition and transactions go through the writer, which makes
///   them linearizable for every engine sharing the database file.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Create a new DatabasePool with split reader/writer connections.
    ///
    /// Runs migrations automatically on the writer pool.
    /// Both pools use WAL journal mode, foreign key enforcement, and 5-second busy timeout.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        // Run migrations on writer before opening reader pool
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(url = database_url, "database pool ready");
        Ok(Self { reader, writer })
    }

    /// Close both pools, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.reader.close().await;
        self.writer.close().await;
    }
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool").finish_non_exhaustive()
    }
}

/// Returns the default database URL.
///
/// `CONDUCTOR_DATABASE_URL` wins when set; otherwise the database lives in
/// `CONDUCTOR_DATA_DIR` (default `~/.conductor`) as `conductor.db`.
pub fn default_database_url() -> String {
    if let Ok(url) = std::env::var("CONDUCTOR_DATABASE_URL") {
        return url;
    }
    format!("sqlite://{}/conductor.db", default_data_dir())
}

/// Data directory from `CONDUCTOR_DATA_DIR`, falling back to `~/.conductor`.
pub fn default_data_dir() -> String {
    std::env::var("CONDUCTOR_DATA_DIR").unwrap_or_else(|_| {
        let home = dirs::home_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        format!("{home}/.conductor")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(name: &str) -> (tempfile::TempDir, String, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join(name).display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, url, pool)
    }

    #[tokio::test]
    async fn migrations_create_engine_tables() {
        let (_dir, _url, pool) = open("schema.db").await;
        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for expected in [
            "distributed_locks",
            "engine_instances",
            "node_instances",
            "workflow_assignments",
            "workflow_definitions",
            "workflow_instances",
        ] {
            assert!(names.contains(&expected), "{expected} table missing");
        }
    }

    #[tokio::test]
    async fn writer_runs_wal_with_foreign_keys() {
        let (_dir, _url, pool) = open("pragmas.db").await;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        let (fk,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn reader_pool_rejects_writes() {
        let (_dir, _url, pool) = open("readonly.db").await;
        let result = sqlx::query("DELETE FROM distributed_locks")
            .execute(&pool.reader)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn status_check_rejects_unknown_values() {
        let (_dir, _url, pool) = open("check.db").await;
        let result = sqlx::query(
            r#"INSERT INTO workflow_instances
               (definition_id, definition_version, status, input_data, context_data,
                completed_nodes, failed_nodes, created_at, updated_at)
               VALUES ('d', '1', 'sleeping', '{}', '{}', '[]', '[]', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')"#,
        )
        .execute(&pool.writer)
        .await;
        assert!(result.is_err(), "unknown status must violate the CHECK constraint");
    }

    #[tokio::test]
    async fn reopen_keeps_schema_and_rows() {
        let (_dir, url, first) = open("reopen.db").await;
        sqlx::query(
            "INSERT INTO distributed_locks (lock_key, owner, resource_type, acquired_at, expires_at) VALUES ('k', 'e', 'workflow', 'now', 0)",
        )
        .execute(&first.writer)
        .await
        .unwrap();
        first.close().await;

        let second = DatabasePool::new(&url).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM distributed_locks")
            .fetch_one(&second.reader)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn default_database_url_points_at_sqlite() {
        let url = default_database_url();
        assert!(url.starts_with("sqlite://") || std::env::var("CONDUCTOR_DATABASE_URL").is_ok());
    }
}

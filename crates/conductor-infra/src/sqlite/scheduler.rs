//! SQLite engine registry implementing `DistributedScheduler`.
//!
//! Engines live in `engine_instances`; sticky workflow assignments live in
//! `workflow_assignments` and disappear with their engine row. Selection
//! reuses the core `select_engine` ordering over the live rows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_core::scheduler::{DistributedScheduler, SchedulerError, is_alive, select_engine};
use conductor_types::engine::{EngineInfo, EngineLoad};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::pool::DatabasePool;

/// SQLite-backed scheduler shared by every engine on the same database.
#[derive(Debug, Clone)]
pub struct SqliteScheduler {
    pool: DatabasePool,
    stale_after: Duration,
}

impl SqliteScheduler {
    pub fn new(pool: DatabasePool, stale_after: Duration) -> Self {
        Self { pool, stale_after }
    }

    async fn engines(&self) -> Result<Vec<EngineInfo>, SchedulerError> {
        let rows = sqlx::query("SELECT * FROM engine_instances ORDER BY instance_id ASC")
            .fetch_all(&self.pool.writer)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| EngineRow::from_row(row).map_err(backend)?.into_info())
            .collect()
    }

    /// Delete engines whose heartbeat is older than the staleness window.
    pub async fn prune_stale(&self) -> Result<Vec<String>, SchedulerError> {
        let now = Utc::now();
        let stale: Vec<String> = self
            .engines()
            .await?
            .into_iter()
            .filter(|e| !is_alive(e, now, self.stale_after))
            .map(|e| e.instance_id)
            .collect();
        for id in &stale {
            self.unregister_engine(id).await?;
            tracing::info!(engine_id = %id, "pruned stale engine");
        }
        Ok(stale)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct EngineRow {
    instance_id: String,
    hostname: String,
    load: String,
    supported_executors: String,
    last_heartbeat: String,
    started_at: String,
}

impl EngineRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            instance_id: row.try_get("instance_id")?,
            hostname: row.try_get("hostname")?,
            load: row.try_get("load")?,
            supported_executors: row.try_get("supported_executors")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            started_at: row.try_get("started_at")?,
        })
    }

    fn into_info(self) -> Result<EngineInfo, SchedulerError> {
        Ok(EngineInfo {
            instance_id: self.instance_id,
            hostname: self.hostname,
            load: serde_json::from_str(&self.load)
                .map_err(|e| SchedulerError::Backend(format!("invalid engine load JSON: {e}")))?,
            supported_executors: serde_json::from_str(&self.supported_executors)
                .map_err(|e| SchedulerError::Backend(format!("invalid executors JSON: {e}")))?,
            last_heartbeat: parse_datetime(&self.last_heartbeat)?,
            started_at: parse_datetime(&self.started_at)?,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, SchedulerError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Backend(format!("invalid datetime: {e}")))
}

fn backend(e: sqlx::Error) -> SchedulerError {
    SchedulerError::Backend(e.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, SchedulerError> {
    serde_json::to_string(value).map_err(|e| SchedulerError::Backend(format!("serialize: {e}")))
}

// ---------------------------------------------------------------------------
// DistributedScheduler impl
// ---------------------------------------------------------------------------

impl DistributedScheduler for SqliteScheduler {
    async fn register_engine(&self, info: &EngineInfo) -> Result<(), SchedulerError> {
        sqlx::query(
            r#"INSERT INTO engine_instances
               (instance_id, hostname, load, supported_executors, last_heartbeat, started_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(instance_id) DO UPDATE SET
                 hostname = excluded.hostname,
                 load = excluded.load,
                 supported_executors = excluded.supported_executors,
                 last_heartbeat = excluded.last_heartbeat,
                 started_at = excluded.started_at"#,
        )
        .bind(&info.instance_id)
        .bind(&info.hostname)
        .bind(to_json(&info.load)?)
        .bind(to_json(&info.supported_executors)?)
        .bind(info.last_heartbeat.to_rfc3339())
        .bind(info.started_at.to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        tracing::info!(engine_id = %info.instance_id, hostname = %info.hostname, "engine registered");
        Ok(())
    }

    async fn unregister_engine(&self, engine_id: &str) -> Result<(), SchedulerError> {
        sqlx::query("DELETE FROM engine_instances WHERE instance_id = ?")
            .bind(engine_id)
            .execute(&self.pool.writer)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn update_heartbeat(&self, engine_id: &str, load: &EngineLoad) -> Result<(), SchedulerError> {
        let result = sqlx::query(
            "UPDATE engine_instances SET load = ?, last_heartbeat = ? WHERE instance_id = ?",
        )
        .bind(to_json(load)?)
        .bind(Utc::now().to_rfc3339())
        .bind(engine_id)
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::UnknownEngine(engine_id.to_string()));
        }
        Ok(())
    }

    async fn assign_workflow(&self, instance_id: i64) -> Result<Option<String>, SchedulerError> {
        let now = Utc::now();
        let engines = self.engines().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT engine_id FROM workflow_assignments WHERE workflow_instance_id = ?")
                .bind(instance_id)
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(backend)?;
        if let Some((current,)) = current {
            let alive = engines
                .iter()
                .any(|e| e.instance_id == current && is_alive(e, now, self.stale_after));
            if alive {
                return Ok(Some(current));
            }
        }

        let chosen = select_engine(&engines, &[], now, self.stale_after).map(|e| e.instance_id.clone());
        match &chosen {
            Some(engine_id) => {
                sqlx::query(
                    r#"INSERT INTO workflow_assignments (workflow_instance_id, engine_id, assigned_at)
                       VALUES (?, ?, ?)
                       ON CONFLICT(workflow_instance_id) DO UPDATE SET
                         engine_id = excluded.engine_id,
                         assigned_at = excluded.assigned_at"#,
                )
                .bind(instance_id)
                .bind(engine_id)
                .bind(now.to_rfc3339())
                .execute(&self.pool.writer)
                .await
                .map_err(backend)?;
            }
            None => {
                sqlx::query("DELETE FROM workflow_assignments WHERE workflow_instance_id = ?")
                    .bind(instance_id)
                    .execute(&self.pool.writer)
                    .await
                    .map_err(backend)?;
            }
        }
        Ok(chosen)
    }

    async fn assign_node(
        &self,
        _instance_id: i64,
        _node_id: &str,
        capabilities: &[String],
    ) -> Result<Option<String>, SchedulerError> {
        let engines = self.engines().await?;
        Ok(select_engine(&engines, capabilities, Utc::now(), self.stale_after)
            .map(|e| e.instance_id.clone()))
    }

    async fn list_engines(&self) -> Result<Vec<EngineInfo>, SchedulerError> {
        self.engines().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("scheduler.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn info(id: &str, workflows: u32, executors: &[&str]) -> EngineInfo {
        EngineInfo {
            instance_id: id.to_string(),
            hostname: "worker-1".to_string(),
            load: EngineLoad {
                active_workflows: workflows,
                ..Default::default()
            },
            supported_executors: executors.iter().map(|s| s.to_string()).collect(),
            last_heartbeat: Utc::now(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn registration_roundtrip() {
        let scheduler = SqliteScheduler::new(test_pool().await, Duration::from_secs(30));
        scheduler.register_engine(&info("a", 2, &["echo"])).await.unwrap();
        scheduler.register_engine(&info("a", 3, &["echo", "delay"])).await.unwrap();

        let engines = scheduler.list_engines().await.unwrap();
        assert_eq!(engines.len(), 1);
        assert_eq!(engines[0].load.active_workflows, 3);
        assert_eq!(engines[0].supported_executors, vec!["echo", "delay"]);

        scheduler.unregister_engine("a").await.unwrap();
        assert!(scheduler.list_engines().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn least_loaded_engine_wins_and_sticks() {
        let scheduler = SqliteScheduler::new(test_pool().await, Duration::from_secs(30));
        scheduler.register_engine(&info("a", 5, &["echo"])).await.unwrap();
        scheduler.register_engine(&info("b", 1, &["echo"])).await.unwrap();

        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("b"));
        scheduler
            .update_heartbeat("b", &EngineLoad { active_workflows: 9, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("b"));
        assert_eq!(scheduler.assign_workflow(2).await.unwrap().as_deref(), Some("a"));

        scheduler.unregister_engine("b").await.unwrap();
        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn node_assignment_respects_capabilities() {
        let scheduler = SqliteScheduler::new(test_pool().await, Duration::from_secs(30));
        scheduler.register_engine(&info("a", 0, &["echo"])).await.unwrap();
        scheduler.register_engine(&info("b", 4, &["echo", "http"])).await.unwrap();

        let caps = vec!["http".to_string()];
        assert_eq!(scheduler.assign_node(1, "call", &caps).await.unwrap().as_deref(), Some("b"));
        let none = vec!["gpu".to_string()];
        assert!(scheduler.assign_node(1, "train", &none).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_engines_are_skipped_and_pruned() {
        let scheduler = SqliteScheduler::new(test_pool().await, Duration::from_secs(30));
        let mut old = info("old", 0, &["echo"]);
        old.last_heartbeat = Utc::now() - chrono::Duration::minutes(5);
        scheduler.register_engine(&old).await.unwrap();
        scheduler.register_engine(&info("fresh", 7, &["echo"])).await.unwrap();

        assert_eq!(scheduler.assign_workflow(1).await.unwrap().as_deref(), Some("fresh"));
        assert_eq!(scheduler.prune_stale().await.unwrap(), vec!["old".to_string()]);
        assert_eq!(scheduler.list_engines().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_engine_fails() {
        let scheduler = SqliteScheduler::new(test_pool().await, Duration::from_secs(30));
        let err = scheduler
            .update_heartbeat("ghost", &EngineLoad::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownEngine(_)));
        assert!(scheduler.assign_workflow(1).await.unwrap().is_none());
    }
}

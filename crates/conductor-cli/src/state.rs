//! Application state wiring the engine to the SQLite backends.
//!
//! AppState pins the generic `WorkflowEngine` to the concrete infra
//! implementations and owns the shared database pool.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use conductor_core::lock::BoxLockManager;
use conductor_core::scheduler::BoxScheduler;
use conductor_core::workflow::{ExecutorRegistry, WorkflowEngine};
use conductor_infra::config::{default_config_path, load_engine_config};
use conductor_infra::sqlite::lock::SqliteLockManager;
use conductor_infra::sqlite::pool::{DatabasePool, default_data_dir, default_database_url};
use conductor_infra::sqlite::scheduler::SqliteScheduler;
use conductor_infra::sqlite::workflow::SqliteWorkflowRepository;

pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;

/// Shared state used by every CLI command.
pub struct AppState {
    pub engine: ConcreteEngine,
    pub repo: SqliteWorkflowRepository,
    pub db_pool: DatabasePool,
    pub database_url: String,
}

impl AppState {
    /// Connect to the database, load `conductor.toml`, and build the engine.
    ///
    /// The default data directory is created only when neither a database
    /// URL nor a config path was given explicitly.
    pub async fn init(database: Option<String>, config: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(default_data_dir());
        if database.is_none() || config.is_none() {
            tokio::fs::create_dir_all(&data_dir)
                .await
                .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
        }

        let config_path = config.unwrap_or_else(|| default_config_path(&data_dir));
        let config = load_engine_config(&config_path).await;

        let database_url = database.unwrap_or_else(default_database_url);
        let db_pool = DatabasePool::new(&database_url)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        let repo = SqliteWorkflowRepository::new(db_pool.clone());
        let stale_after: Duration = config.scheduler_stale_after();
        let engine = WorkflowEngine::builder(repo.clone())
            .config(config)
            .registry(ExecutorRegistry::with_builtins())
            .lock_manager(BoxLockManager::new(SqliteLockManager::new(db_pool.clone())))
            .scheduler(BoxScheduler::new(SqliteScheduler::new(db_pool.clone(), stale_after)))
            .build();

        Ok(Self {
            engine,
            repo,
            db_pool,
            database_url,
        })
    }

    /// Shut the engine down and close the pool.
    pub async fn close(self) {
        self.engine.shutdown().await;
        self.db_pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::repository::workflow::WorkflowRepository;
    use conductor_core::workflow::StartOptions;
    use conductor_core::workflow::definition::load_definition_file;
    use conductor_types::instance::WorkflowStatus;
    use serde_json::json;

    #[tokio::test]
    async fn init_wires_engine_to_sqlite() {
        let tmp = tempfile::tempdir().unwrap();
        let db = format!("sqlite://{}?mode=rwc", tmp.path().join("cli.db").display());
        let config = tmp.path().join("conductor.toml");
        tokio::fs::write(&config, "engine_id = \"cli-test\"\nshutdown_timeout_ms = 500\n")
            .await
            .unwrap();

        let state = AppState::init(Some(db), Some(config)).await.unwrap();
        assert_eq!(state.engine.engine_id(), "cli-test");

        let file = tmp.path().join("greet.yaml");
        tokio::fs::write(
            &file,
            "id: greet\nname: Greet\nnodes:\n  - { id: hello, type: task, executor: echo, config: { to: \"${input.who}\" } }\n",
        )
        .await
        .unwrap();
        let def = load_definition_file(&file).unwrap();
        state.engine.register_definition(&def).await.unwrap();
        assert_eq!(state.repo.list_definitions().await.unwrap().len(), 1);

        let instance = state
            .engine
            .start_by_id("greet", None, StartOptions::with_inputs(json!({"who": "ops"})))
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.output_data.unwrap()["hello"]["to"], json!("ops"));

        state.close().await;
    }
}

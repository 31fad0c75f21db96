//! SQLite storage layer.
//!
//! Repository, lease, and engine-registry implementations backed by SQLite
//! with WAL mode and split read/write connection pools.

pub mod lock;
pub mod pool;
pub mod scheduler;
pub mod workflow;

#[cfg(test)]
mod tests {
    //! The workflow engine running entirely on the SQLite backends.

    use std::time::Duration;

    use conductor_core::lock::BoxLockManager;
    use conductor_core::repository::workflow::WorkflowRepository;
    use conductor_core::scheduler::{BoxScheduler, DistributedScheduler};
    use conductor_core::workflow::definition::parse_definition;
    use conductor_core::workflow::{EngineError, ExecutorRegistry, StartOptions, WorkflowEngine};
    use conductor_types::config::EngineConfig;
    use conductor_types::instance::{Checkpoint, NewWorkflowInstance, WorkflowStatus};
    use conductor_types::node::{NewNodeInstance, NodeStatus, NodeType, NodeUpdate};
    use serde_json::json;

    use super::lock::SqliteLockManager;
    use super::pool::DatabasePool;
    use super::scheduler::SqliteScheduler;
    use super::workflow::SqliteWorkflowRepository;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("engine.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn config(engine_id: &str) -> EngineConfig {
        EngineConfig {
            engine_id: Some(engine_id.to_string()),
            dependency_poll_interval_ms: 5,
            dependency_wait_timeout_ms: 2_000,
            node_slot_timeout_ms: 1_000,
            shutdown_timeout_ms: 1_000,
            context_idle_timeout_ms: 0,
            ..Default::default()
        }
    }

    fn engine(pool: &DatabasePool, engine_id: &str) -> WorkflowEngine<SqliteWorkflowRepository> {
        WorkflowEngine::builder(SqliteWorkflowRepository::new(pool.clone()))
            .config(config(engine_id))
            .registry(ExecutorRegistry::with_builtins())
            .lock_manager(BoxLockManager::new(SqliteLockManager::new(pool.clone())))
            .scheduler(BoxScheduler::new(SqliteScheduler::new(
                pool.clone(),
                Duration::from_secs(30),
            )))
            .build()
    }

    const PIPELINE: &str = r#"
id: pipeline
name: Pipeline
nodes:
  - id: fetch
    type: task
    executor: items
    config: { items: [1, 2, 3, 4, 5] }
  - id: each
    type: loop
    depends_on: [fetch]
    data_source: { type: expression, expression: "nodes.fetch" }
    body: { executor: echo }
    mode: parallel
    max_concurrency: 2
  - id: report
    type: task
    executor: echo
    depends_on: [each]
    config: { processed: "${nodes.each.completedCount}" }
"#;

    #[tokio::test]
    async fn pipeline_completes_on_sqlite() {
        let pool = test_pool().await;
        let engine = engine(&pool, "engine-a");
        let definition = parse_definition(PIPELINE).unwrap();

        let instance = engine
            .start_workflow(&definition, StartOptions::default())
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        let output = instance.output_data.unwrap();
        assert_eq!(output["each"]["completedCount"], json!(5));
        assert_eq!(output["report"]["processed"], json!(5));

        let nodes = engine.list_nodes(instance.id).await.unwrap();
        let children = nodes
            .iter()
            .filter(|n| n.parent_node_id.as_deref() == Some("each"))
            .count();
        assert_eq!(children, 5);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Completed));

        let locks = SqliteLockManager::new(pool.clone());
        let key = conductor_core::lock::workflow_lock_key(instance.id);
        assert!(locks.holder(&key).await.unwrap().is_none());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn business_key_conflict_on_sqlite() {
        let pool = test_pool().await;
        let engine = engine(&pool, "engine-a");
        let repo = SqliteWorkflowRepository::new(pool.clone());
        let definition = parse_definition(PIPELINE).unwrap();
        repo.save_definition(&definition).await.unwrap();

        // A pending instance already holds the key.
        repo.create_instance(&NewWorkflowInstance {
            definition_id: "pipeline".to_string(),
            definition_version: definition.version.clone(),
            input_data: json!({}),
            business_key: Some("batch-1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

        let err = engine
            .start_by_id("pipeline", None, StartOptions::default().business_key("batch-1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("batch-1"), "unexpected error: {err}");
        assert_eq!(repo.list_instances(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn racing_starts_admit_one_key_holder_on_sqlite() {
        let pool = test_pool().await;
        let first = engine(&pool, "engine-a");
        let second = engine(&pool, "engine-b");
        let definition = parse_definition(
            r#"
id: slow
name: Slow
nodes:
  - { id: wait, type: task, executor: delay, config: { ms: 300 } }
"#,
        )
        .unwrap();

        let (a, b) = tokio::join!(
            first.start_workflow(&definition, StartOptions::default().business_key("batch-9")),
            second.start_workflow(&definition, StartOptions::default().business_key("batch-9")),
        );
        let results = [a, b];
        let admitted: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].status, WorkflowStatus::Completed);
        let refused = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(
            matches!(refused, EngineError::BusinessKeyConflict { key, .. } if key == "batch-9"),
            "unexpected error: {refused}"
        );

        let repo = SqliteWorkflowRepository::new(pool.clone());
        assert_eq!(repo.list_instances(None, 10).await.unwrap().len(), 1);
        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_across_engines_on_sqlite() {
        let pool = test_pool().await;
        let repo = SqliteWorkflowRepository::new(pool.clone());
        let definition = parse_definition(
            r#"
id: two-step
name: Two Step
nodes:
  - { id: a, type: task, executor: echo, config: { from: live } }
  - { id: b, type: task, executor: echo, depends_on: [a] }
"#,
        )
        .unwrap();
        repo.save_definition(&definition).await.unwrap();

        // Simulate an engine that died after completing `a`.
        let inst = repo
            .create_instance(&NewWorkflowInstance {
                definition_id: "two-step".to_string(),
                definition_version: definition.version.clone(),
                input_data: json!({}),
                max_retries: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        repo.update_status(inst.id, WorkflowStatus::Running, None).await.unwrap();
        let a = repo
            .create_node(&NewNodeInstance::new(inst.id, "a", "a", NodeType::Task))
            .await
            .unwrap();
        repo.update_node_status(a.id, &NodeUpdate::completed(json!({"from": "before"}), 1))
            .await
            .unwrap();
        repo.update_checkpoint(
            inst.id,
            &Checkpoint {
                current_node_id: Some("a".to_string()),
                completed_nodes: vec!["a".to_string()],
                failed_nodes: vec![],
                context_data: json!({"nodes": {"a": {"from": "before"}}, "vars": {}}),
            },
        )
        .await
        .unwrap();

        let first = engine(&pool, "engine-a");
        let second = engine(&pool, "engine-b");
        first.start().await.unwrap();
        second.start().await.unwrap();

        let (x, y) = tokio::join!(first.recover_interrupted(10), second.recover_interrupted(10));
        let claimed: Vec<i64> = x.unwrap().into_iter().chain(y.unwrap()).collect();
        assert_eq!(claimed, vec![inst.id]);
        first.wait_for_recovery(inst.id).await;
        second.wait_for_recovery(inst.id).await;

        let done = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        let output = done.output_data.unwrap();
        assert_eq!(output["a"], json!({"from": "before"}));
        // `a` was not re-run: its row still carries the pre-crash output.
        let a = repo.find_by_node_id(inst.id, "a").await.unwrap().unwrap();
        assert_eq!(a.output_data, Some(json!({"from": "before"})));
        assert_eq!(repo.list_nodes(inst.id).await.unwrap().len(), 2);

        first.shutdown().await;
        second.shutdown().await;
        let scheduler = SqliteScheduler::new(pool.clone(), Duration::from_secs(30));
        assert!(scheduler.list_engines().await.unwrap().is_empty());
    }
}

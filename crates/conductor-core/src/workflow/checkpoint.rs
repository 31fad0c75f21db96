//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps `WorkflowRepository` to provide a higher-level API for recording
//! node-level transitions and instance checkpoints. Every transition is
//! persisted before the engine moves forward, so a crashed workflow resumes
//! from the last completed node.

use conductor_types::error::{ErrorDetails, RepositoryError};
use conductor_types::instance::{Checkpoint, WorkflowStatus};
use conductor_types::node::{LoopProgress, NewNodeInstance, NodeStatus, NodeUpdate};
use serde_json::Value;

use crate::repository::workflow::{RepositoryOp, WorkflowRepository};

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow instances.
///
/// Generic over `R: WorkflowRepository` so it works with any storage
/// backend (SQLite, in-memory).
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: R,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Node-level checkpoints
    // -----------------------------------------------------------------------

    /// Checkpoint a node as starting (-> running), recording its input.
    pub async fn checkpoint_node_start(
        &self,
        node_pk: i64,
        input: &Value,
        attempt: u32,
    ) -> Result<(), RepositoryError> {
        self.repo
            .update_node_status(node_pk, &NodeUpdate::running(input.clone(), attempt))
            .await?;
        tracing::debug!(node_pk, attempt, "checkpointed node start");
        Ok(())
    }

    pub async fn checkpoint_node_complete(
        &self,
        node_pk: i64,
        output: &Value,
        duration_ms: i64,
    ) -> Result<(), RepositoryError> {
        self.repo
            .update_node_status(node_pk, &NodeUpdate::completed(output.clone(), duration_ms))
            .await?;
        tracing::debug!(node_pk, duration_ms, "checkpointed node complete");
        Ok(())
    }

    /// Checkpoint a node as failed. `output` carries any partial aggregate.
    pub async fn checkpoint_node_failed(
        &self,
        node_pk: i64,
        details: &ErrorDetails,
        output: Option<Value>,
        duration_ms: i64,
    ) -> Result<(), RepositoryError> {
        self.repo
            .update_node_status(
                node_pk,
                &NodeUpdate::failed(details.clone(), output, duration_ms),
            )
            .await?;
        tracing::debug!(node_pk, category = %details.category, "checkpointed node failed");
        Ok(())
    }

    /// Put an interrupted node back to `pending` so the next drive re-runs it.
    pub async fn checkpoint_node_interrupted(&self, node_pk: i64) -> Result<(), RepositoryError> {
        self.repo
            .update_node_status(node_pk, &NodeUpdate::new(NodeStatus::Pending))
            .await?;
        tracing::debug!(node_pk, "checkpointed node interrupted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loop children
    // -----------------------------------------------------------------------

    /// Create every loop child and flip the loop to `executing` in one
    /// transaction. Children already present are kept as they are.
    pub async fn checkpoint_loop_children(
        &self,
        loop_pk: i64,
        children: Vec<NewNodeInstance>,
    ) -> Result<LoopProgress, RepositoryError> {
        let total = u32::try_from(children.len()).unwrap_or(u32::MAX);
        let progress = LoopProgress::executing(total);
        self.repo
            .transaction(vec![
                RepositoryOp::CreateNodes(children),
                RepositoryOp::UpdateLoopProgress {
                    id: loop_pk,
                    progress,
                },
            ])
            .await?;
        tracing::debug!(loop_pk, total, "checkpointed loop children");
        Ok(progress)
    }

    pub async fn checkpoint_loop_progress(
        &self,
        loop_pk: i64,
        progress: &LoopProgress,
    ) -> Result<(), RepositoryError> {
        self.repo.update_loop_progress(loop_pk, progress).await
    }

    /// Skip every pending child of a fail-fast loop and record the final
    /// progress together.
    pub async fn checkpoint_loop_abort(
        &self,
        instance_id: i64,
        loop_pk: i64,
        loop_node_id: &str,
        progress: LoopProgress,
    ) -> Result<(), RepositoryError> {
        self.repo
            .transaction(vec![
                RepositoryOp::UpdateChildStatus {
                    instance_id,
                    parent_node_id: loop_node_id.to_string(),
                    from: NodeStatus::Pending,
                    to: NodeStatus::Skipped,
                },
                RepositoryOp::UpdateLoopProgress {
                    id: loop_pk,
                    progress,
                },
            ])
            .await?;
        tracing::debug!(instance_id, loop_node_id, "checkpointed loop abort");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Instance-level checkpoints
    // -----------------------------------------------------------------------

    pub async fn checkpoint_instance(
        &self,
        instance_id: i64,
        checkpoint: &Checkpoint,
    ) -> Result<(), RepositoryError> {
        self.repo.update_checkpoint(instance_id, checkpoint).await?;
        tracing::debug!(
            instance_id,
            current_node_id = ?checkpoint.current_node_id,
            completed = checkpoint.completed_nodes.len(),
            "checkpointed instance"
        );
        Ok(())
    }

    pub async fn checkpoint_status(
        &self,
        instance_id: i64,
        status: WorkflowStatus,
        error: Option<&ErrorDetails>,
    ) -> Result<(), RepositoryError> {
        self.repo.update_status(instance_id, status, error).await?;
        tracing::debug!(instance_id, status = %status, "checkpointed status");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryWorkflowRepository;
    use conductor_types::instance::NewWorkflowInstance;
    use conductor_types::node::{LoopPhase, NodeType, loop_child_id};
    use serde_json::json;

    async fn setup() -> (CheckpointManager<InMemoryWorkflowRepository>, i64, i64) {
        let repo = InMemoryWorkflowRepository::new();
        let instance = repo
            .create_instance(&NewWorkflowInstance {
                definition_id: "wf".to_string(),
                definition_version: "1.0.0".to_string(),
                input_data: json!({}),
                ..Default::default()
            })
            .await
            .unwrap();
        let node = repo
            .create_node(&NewNodeInstance::new(instance.id, "each", "each", NodeType::Loop))
            .await
            .unwrap();
        (CheckpointManager::new(repo), instance.id, node.id)
    }

    fn children(instance_id: i64, n: usize) -> Vec<NewNodeInstance> {
        (0..n)
            .map(|i| {
                let mut child = NewNodeInstance::new(instance_id, loop_child_id("each", i), "each", NodeType::Task);
                child.parent_node_id = Some("each".to_string());
                child.child_index = Some(i as u32);
                child
            })
            .collect()
    }

    #[tokio::test]
    async fn loop_children_creation_is_repeatable() {
        let (mgr, instance_id, loop_pk) = setup().await;
        mgr.checkpoint_loop_children(loop_pk, children(instance_id, 3)).await.unwrap();
        mgr.checkpoint_loop_children(loop_pk, children(instance_id, 3)).await.unwrap();

        let rows = mgr.repo().find_child_nodes(instance_id, "each").await.unwrap();
        assert_eq!(rows.len(), 3);
        let node = mgr.repo().get_node(loop_pk).await.unwrap().unwrap();
        let progress = node.loop_progress.unwrap();
        assert_eq!(progress.status, LoopPhase::Executing);
        assert_eq!(progress.total_count, 3);
    }

    #[tokio::test]
    async fn loop_abort_skips_pending_children() {
        let (mgr, instance_id, loop_pk) = setup().await;
        mgr.checkpoint_loop_children(loop_pk, children(instance_id, 3)).await.unwrap();
        let first = mgr.repo().find_by_node_id(instance_id, "each[0]").await.unwrap().unwrap();
        mgr.checkpoint_node_complete(first.id, &json!(1), 1).await.unwrap();

        let progress = LoopProgress {
            status: LoopPhase::Completed,
            total_count: 3,
            completed_count: 1,
            failed_count: 0,
        };
        mgr.checkpoint_loop_abort(instance_id, loop_pk, "each", progress).await.unwrap();

        let rows = mgr.repo().find_child_nodes(instance_id, "each").await.unwrap();
        let statuses: Vec<NodeStatus> = rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![NodeStatus::Completed, NodeStatus::Skipped, NodeStatus::Skipped]
        );
    }

    #[tokio::test]
    async fn failed_transaction_creates_nothing() {
        let (mgr, instance_id, loop_pk) = setup().await;
        mgr.repo().fail_next_transactions(1);
        assert!(mgr.checkpoint_loop_children(loop_pk, children(instance_id, 2)).await.is_err());
        assert!(mgr.repo().find_child_nodes(instance_id, "each").await.unwrap().is_empty());
        let node = mgr.repo().get_node(loop_pk).await.unwrap().unwrap();
        assert!(node.loop_progress.is_none_or(|p| p.status == LoopPhase::Creating));
    }
}

//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, workflow
//! instances, and node instances. The infrastructure layer
//! (conductor-infra) implements this trait with SQLite persistence;
//! [`super::memory::InMemoryWorkflowRepository`] implements it in-process.

use conductor_types::definition::WorkflowDefinition;
use conductor_types::error::{ErrorDetails, RepositoryError};
use conductor_types::instance::{Checkpoint, NewWorkflowInstance, WorkflowInstance, WorkflowStatus};
use conductor_types::node::{LoopProgress, NewNodeInstance, NodeInstance, NodeStatus, NodeUpdate};
use serde_json::Value;

/// One write inside a [`WorkflowRepository::transaction`] batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RepositoryOp {
    /// Insert node rows, skipping any whose `(instance, node_id)` exists.
    CreateNodes(Vec<NewNodeInstance>),
    UpdateNodeStatus {
        id: i64,
        update: NodeUpdate,
    },
    UpdateLoopProgress {
        id: i64,
        progress: LoopProgress,
    },
    UpdateChildStatus {
        instance_id: i64,
        parent_node_id: String,
        from: NodeStatus,
        to: NodeStatus,
    },
    UpdateStatus {
        id: i64,
        status: WorkflowStatus,
        error: Option<ErrorDetails>,
    },
    UpdateCheckpoint {
        id: i64,
        checkpoint: Checkpoint,
    },
}

/// Repository trait for workflow persistence.
///
/// Covers three entity families:
/// - **Definitions:** immutable, versioned workflow templates.
/// - **Instances:** one row per workflow execution, including checkpoint,
///   lock, and retry bookkeeping.
/// - **Nodes:** one row per executed node or spawned child, unique by
///   `(workflow_instance_id, node_id)`.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a definition keyed by `(id, version)`.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a definition. `version = None` returns the most recently saved version.
    fn get_definition(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest version of every stored definition, ordered by id.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Persist a new `pending` instance and return it with its assigned id.
    ///
    /// Fails with [`RepositoryError::Conflict`] when the external id exists
    /// or when another instance still holds the business or mutex key (see
    /// [`WorkflowInstance::holds_keys`]). The key check and the insert are
    /// one atomic step.
    fn create_instance(
        &self,
        instance: &NewWorkflowInstance,
    ) -> impl std::future::Future<Output = Result<WorkflowInstance, RepositoryError>> + Send;

    fn get_instance(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Most recent instances first, optionally filtered by status.
    fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Set the status and replace `error_details`.
    ///
    /// `started_at` is stamped on the first transition to `running`;
    /// `completed_at` is stamped on terminal statuses and cleared otherwise.
    fn update_status(
        &self,
        id: i64,
        status: WorkflowStatus,
        error: Option<&ErrorDetails>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_output(
        &self,
        id: i64,
        output: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist the checkpoint (current node, completed/failed sets, variables).
    fn update_checkpoint(
        &self,
        id: i64,
        checkpoint: &Checkpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record (or clear, with `None`) the lock owner. Also refreshes `last_heartbeat`.
    fn update_lock_info(
        &self,
        id: i64,
        owner: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Refresh `last_heartbeat` for instances this engine is driving.
    fn touch_heartbeat(
        &self,
        ids: &[i64],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_retry_count(
        &self,
        id: i64,
        retry_count: u32,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn assign_engine(
        &self,
        id: i64,
        engine_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Instances in one of `statuses`, highest priority first, oldest first.
    fn find_interrupted_instances(
        &self,
        statuses: &[WorkflowStatus],
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Instances of `definition_id` whose status is not in `exclude_statuses`.
    fn check_instance_lock(
        &self,
        definition_id: &str,
        exclude_statuses: &[WorkflowStatus],
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Instances holding `business_key`: non-terminal ones and failed ones
    /// with an automatic retry still to come.
    fn check_business_instance_lock(
        &self,
        business_key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Instances holding `mutex_key`, by the same rule as business keys.
    fn check_mutex_instance_lock(
        &self,
        mutex_key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Insert a node row. Returns the existing row when
    /// `(workflow_instance_id, node_id)` is already present.
    fn create_node(
        &self,
        node: &NewNodeInstance,
    ) -> impl std::future::Future<Output = Result<NodeInstance, RepositoryError>> + Send;

    /// Insert many node rows atomically. Existing ids are skipped; returns
    /// the number of rows inserted.
    fn create_nodes(
        &self,
        nodes: &[NewNodeInstance],
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn get_node(
        &self,
        id: i64,
    ) -> impl std::future::Future<Output = Result<Option<NodeInstance>, RepositoryError>> + Send;

    fn find_by_node_id(
        &self,
        instance_id: i64,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<NodeInstance>, RepositoryError>> + Send;

    /// Children of `parent_node_id`, ordered by child index, parallel index, id.
    fn find_child_nodes(
        &self,
        instance_id: i64,
        parent_node_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;

    /// Children still to run (`pending`, or `running` left behind by a
    /// crashed process), in child index order.
    fn find_pending_child_nodes(
        &self,
        instance_id: i64,
        parent_node_id: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;

    /// All node rows of an instance in creation order.
    fn list_nodes(
        &self,
        instance_id: i64,
    ) -> impl std::future::Future<Output = Result<Vec<NodeInstance>, RepositoryError>> + Send;

    /// Apply a status transition. Fields left `None` keep their stored
    /// value, except that a transition to `running` clears output, error,
    /// and completion fields from a previous attempt.
    fn update_node_status(
        &self,
        id: i64,
        update: &NodeUpdate,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn update_loop_progress(
        &self,
        id: i64,
        progress: &LoopProgress,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Move every child of `parent_node_id` in status `from` to `to`.
    fn update_child_status(
        &self,
        instance_id: i64,
        parent_node_id: &str,
        from: NodeStatus,
        to: NodeStatus,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Unit of work
    // -----------------------------------------------------------------------

    /// Apply `ops` in order, committing all of them or none.
    fn transaction(
        &self,
        ops: Vec<RepositoryOp>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}

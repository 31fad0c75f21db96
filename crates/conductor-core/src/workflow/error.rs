//! Engine error type.
//!
//! Every failure the engine can observe maps to one `EngineError` variant;
//! the [`super::retry::ErrorClassifier`] turns variants into the persisted
//! error taxonomy.

use conductor_types::error::{ErrorCategory, RepositoryError};
use conductor_types::instance::WorkflowStatus;
use serde_json::Value;

use crate::concurrency::ResourceClass;
use crate::lock::LockError;
use crate::scheduler::SchedulerError;

use super::expression::ExpressionError;
use super::registry::TaskError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("circular dependency detected involving node '{0}'")]
    CircularDependency(String),

    #[error("executor not found: '{0}'")]
    ExecutorNotFound(String),

    #[error("no {0} slot available")]
    ResourceExhausted(ResourceClass),

    #[error("business key '{key}' is held by active instance(s) {instances:?}")]
    BusinessKeyConflict { key: String, instances: Vec<i64> },

    #[error("mutex key '{key}' is held by active instance(s) {instances:?}")]
    MutexKeyConflict { key: String, instances: Vec<i64> },

    #[error("definition '{definition_id}' is singleton and has active instance(s) {instances:?}")]
    InstanceLocked {
        definition_id: String,
        instances: Vec<i64>,
    },

    #[error("lock '{0}' is held by another engine")]
    LockNotAcquired(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("executor '{executor}' failed: {source}")]
    Task {
        executor: String,
        #[source]
        source: TaskError,
    },

    /// A node failed. Carries the classification of its root cause and any
    /// partial output the node produced (parallel/loop aggregates).
    #[error("node '{node_id}' failed: {message}")]
    NodeFailed {
        node_id: String,
        message: String,
        category: ErrorCategory,
        output: Option<Value>,
    },

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("lock manager error: {0}")]
    Lock(#[from] LockError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("engine is shutting down")]
    ShuttingDown,

    /// The instance left `running` (paused, cancelled) or the engine is
    /// stopping. Not a failure: the node is left to be re-run on resume.
    #[error("workflow interrupted ({0})")]
    Interrupted(WorkflowStatus),
}

//! Services shared by the driver, the node executors, and the engine.
//!
//! `Runtime` owns the repository (through the checkpoint manager), the
//! executor registry, the expression resolver, slot pools, the lock
//! manager, the event bus, and the context cache. It implements the
//! instance-level bookkeeping every execution path needs: activating a
//! context with its lock, status transitions, completion, and release.

use std::sync::Arc;

use conductor_types::config::EngineConfig;
use conductor_types::definition::WorkflowDefinition;
use conductor_types::error::ErrorDetails;
use conductor_types::event::EngineEvent;
use conductor_types::instance::{WorkflowInstance, WorkflowStatus};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::concurrency::{ConcurrencyManager, ResourceClass};
use crate::event::EventBus;
use crate::lock::{BoxLockManager, workflow_lock_key};
use crate::repository::workflow::WorkflowRepository;

use super::checkpoint::CheckpointManager;
use super::context::{ContextCache, ExecutionContext, SharedContext};
use super::error::EngineError;
use super::expression::ExpressionResolver;
use super::registry::ExecutorRegistry;

/// Lock resource type recorded for workflow instance leases.
pub const WORKFLOW_RESOURCE: &str = "workflow";

pub(crate) struct Runtime<R: WorkflowRepository> {
    pub checkpoints: CheckpointManager<R>,
    pub registry: Arc<ExecutorRegistry>,
    pub resolver: Arc<dyn ExpressionResolver>,
    pub slots: Arc<ConcurrencyManager>,
    pub locks: BoxLockManager,
    pub events: EventBus,
    pub contexts: ContextCache,
    pub config: EngineConfig,
    pub engine_id: String,
    /// Cancelled when shutdown gives up waiting; drivers stop at the next
    /// node boundary and leave the instance for recovery.
    pub stop: CancellationToken,
}

impl<R: WorkflowRepository + 'static> Runtime<R> {
    pub fn repo(&self) -> &R {
        self.checkpoints.repo()
    }

    pub async fn load_instance(&self, instance_id: i64) -> Result<WorkflowInstance, EngineError> {
        self.repo()
            .get_instance(instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow instance {instance_id}")))
    }

    /// Load the exact definition version an instance was started with.
    pub async fn load_definition(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.repo()
            .get_definition(&instance.definition_id, Some(&instance.definition_version))
            .await?
            .map(Arc::new)
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "workflow definition '{}' version '{}'",
                    instance.definition_id, instance.definition_version
                ))
            })
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Apply a validated status transition and mirror it into the context.
    pub async fn transition(
        &self,
        instance_id: i64,
        to: WorkflowStatus,
        error: Option<&ErrorDetails>,
    ) -> Result<WorkflowInstance, EngineError> {
        let mut instance = self.load_instance(instance_id).await?;
        if !instance.status.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                to,
            });
        }
        self.checkpoints
            .checkpoint_status(instance_id, to, error)
            .await?;
        self.contexts.set_status(instance_id, to);
        instance.status = to;
        instance.error_details = error.cloned();
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // Activation / release
    // -----------------------------------------------------------------------

    /// Create the execution context for `instance` and take its lock.
    pub async fn activate(
        &self,
        instance: &WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        depth: u32,
    ) -> Result<SharedContext, EngineError> {
        let ctx = self
            .contexts
            .insert(ExecutionContext::restore(instance, definition, depth));
        if let Err(err) = self.acquire_instance_lock(instance.id).await {
            self.contexts.remove(instance.id);
            return Err(err);
        }
        Ok(ctx)
    }

    /// Acquire `workflow:<id>` and keep it renewed.
    ///
    /// A lock held elsewhere is logged and tolerated unless
    /// `lock.require_acquisition` is set.
    pub async fn acquire_instance_lock(&self, instance_id: i64) -> Result<bool, EngineError> {
        let key = workflow_lock_key(instance_id);
        let require = self.config.lock.require_acquisition;
        match self
            .locks
            .acquire_lock(&key, &self.engine_id, WORKFLOW_RESOURCE, self.config.lock_ttl())
            .await
        {
            Ok(true) => {
                self.locks.enable_auto_renewal(
                    &key,
                    &self.engine_id,
                    WORKFLOW_RESOURCE,
                    self.config.lock_renewal_interval(),
                );
                self.repo()
                    .update_lock_info(instance_id, Some(&self.engine_id))
                    .await?;
                tracing::debug!(instance_id, engine_id = %self.engine_id, "instance lock acquired");
                Ok(true)
            }
            Ok(false) if require => Err(EngineError::LockNotAcquired(key)),
            Ok(false) => {
                tracing::warn!(
                    instance_id,
                    engine_id = %self.engine_id,
                    "instance lock held by another engine; proceeding without it"
                );
                Ok(false)
            }
            Err(err) if require => Err(err.into()),
            Err(err) => {
                tracing::warn!(instance_id, error = %err, "failed to acquire instance lock; proceeding without it");
                Ok(false)
            }
        }
    }

    /// Release the instance lock and workflow slot. Failures are logged.
    pub async fn release_instance(&self, instance_id: i64) {
        let key = workflow_lock_key(instance_id);
        match self.locks.release_lock(&key, &self.engine_id).await {
            Ok(true) => {
                if let Err(err) = self.repo().update_lock_info(instance_id, None).await {
                    tracing::warn!(instance_id, error = %err, "failed to clear lock owner");
                }
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(instance_id, error = %err, "failed to release instance lock"),
        }
        self.slots.release_slot(ResourceClass::Workflow, instance_id);
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Persist the output and mark the instance `completed`.
    pub async fn complete(&self, instance_id: i64, output: &Value) -> Result<(), EngineError> {
        self.repo().update_output(instance_id, output).await?;
        self.transition(instance_id, WorkflowStatus::Completed, None)
            .await?;
        self.events
            .publish(EngineEvent::WorkflowCompleted { instance_id });
        tracing::info!(instance_id, "workflow completed");
        Ok(())
    }

    /// Whether execution of `instance_id` (and of `root_id`, for
    /// sub-workflows) may continue.
    pub async fn check_running(&self, instance_id: i64, root_id: i64) -> Result<(), EngineError> {
        if self.stop.is_cancelled() {
            return Err(EngineError::Interrupted(WorkflowStatus::Running));
        }
        for id in [instance_id, root_id] {
            let status = self.load_instance(id).await?.status;
            if status != WorkflowStatus::Running {
                return Err(EngineError::Interrupted(status));
            }
            if root_id == instance_id {
                break;
            }
        }
        Ok(())
    }
}

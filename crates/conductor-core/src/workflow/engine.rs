//! Workflow engine: the public entry point for running workflows.
//!
//! `WorkflowEngine` wires the runtime (repository, executors, expressions,
//! slots, locks, events, contexts) to the distributed scheduler and owns
//! everything that happens between drives: admission checks, failure
//! classification and retry scheduling, pause/resume/cancel, recovery of
//! interrupted instances, the heartbeat and sweep loops, and shutdown.
//!
//! # Execution flow
//!
//! 1. `start_workflow` validates the definition and inputs, enforces the
//!    key and singleton rules, persists a `pending` instance, and
//!    takes a workflow slot.
//! 2. The instance is activated (context + lock), moved to `running`, and
//!    driven node by node with a checkpoint after every node.
//! 3. On success the output is stored and the instance completes. On
//!    failure the error is classified; transient failures are retried after
//!    an exponential backoff, everything else fails (and may escalate).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conductor_types::config::EngineConfig;
use conductor_types::definition::WorkflowDefinition;
use conductor_types::engine::{EngineInfo, EngineLoad};
use conductor_types::error::{ErrorDetails, RepositoryError};
use conductor_types::event::EngineEvent;
use conductor_types::instance::{NewWorkflowInstance, WorkflowInstance, WorkflowStatus};
use conductor_types::node::NodeInstance;
use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::concurrency::{ConcurrencyManager, ResourceClass, SlotStats};
use crate::event::EventBus;
use crate::lock::{BoxLockManager, InMemoryLockManager, workflow_lock_key};
use crate::repository::workflow::WorkflowRepository;
use crate::scheduler::{BoxScheduler, InMemoryScheduler, SchedulerError};

use super::checkpoint::CheckpointManager;
use super::context::{ContextCache, lock_context};
use super::definition::{materialize_inputs, validate_definition};
use super::error::EngineError;
use super::expression::{ExpressionResolver, JexlResolver};
use super::registry::ExecutorRegistry;
use super::retry::{ErrorClassifier, RetryPolicy};
use super::runtime::{Runtime, WORKFLOW_RESOURCE};

// ---------------------------------------------------------------------------
// StartOptions
// ---------------------------------------------------------------------------

/// Per-start parameters for [`WorkflowEngine::start_workflow`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Workflow inputs. `null` is treated as an empty object.
    pub inputs: Value,
    /// At most one instance may hold a business key at a time; a failed
    /// instance keeps it while an automatic retry is scheduled.
    pub business_key: Option<String>,
    /// Held under the same rule as `business_key`, but shared across
    /// unrelated business keys.
    pub mutex_key: Option<String>,
    pub external_id: Option<String>,
    /// Overrides the definition's `config.retry.max_retries`.
    pub max_retries: Option<u32>,
}

impl StartOptions {
    pub fn with_inputs(inputs: Value) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn business_key(mut self, key: impl Into<String>) -> Self {
        self.business_key = Some(key.into());
        self
    }

    pub fn mutex_key(mut self, key: impl Into<String>) -> Self {
        self.mutex_key = Some(key.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`WorkflowEngine`]. Every collaborator except the
/// repository has an in-process default.
pub struct WorkflowEngineBuilder<R: WorkflowRepository> {
    repo: R,
    config: EngineConfig,
    registry: Option<ExecutorRegistry>,
    resolver: Option<Arc<dyn ExpressionResolver>>,
    locks: Option<BoxLockManager>,
    scheduler: Option<BoxScheduler>,
    events: Option<EventBus>,
}

impl<R: WorkflowRepository + 'static> WorkflowEngineBuilder<R> {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Executors available to task nodes. Defaults to the built-ins.
    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn expression_resolver<E: ExpressionResolver + 'static>(mut self, resolver: E) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn lock_manager(mut self, locks: BoxLockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn scheduler(mut self, scheduler: BoxScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> WorkflowEngine<R> {
        let config = self.config.validated();
        let engine_id = config
            .engine_id
            .clone()
            .unwrap_or_else(|| format!("engine-{}", Uuid::now_v7()));
        let hostname = config
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "localhost".to_string());

        let scheduler = self.scheduler.unwrap_or_else(|| {
            BoxScheduler::new(InMemoryScheduler::new(config.scheduler_stale_after()))
        });
        let runtime = Runtime {
            checkpoints: CheckpointManager::new(self.repo),
            registry: Arc::new(self.registry.unwrap_or_else(ExecutorRegistry::with_builtins)),
            resolver: self.resolver.unwrap_or_else(|| Arc::new(JexlResolver::new())),
            slots: Arc::new(ConcurrencyManager::new(
                config.max_concurrent_workflows,
                config.max_concurrent_nodes,
            )),
            locks: self
                .locks
                .unwrap_or_else(|| BoxLockManager::new(InMemoryLockManager::new())),
            events: self
                .events
                .unwrap_or_else(|| EventBus::new(config.event_capacity)),
            contexts: ContextCache::new(),
            engine_id,
            stop: CancellationToken::new(),
            config,
        };

        WorkflowEngine {
            inner: Arc::new(EngineInner {
                runtime,
                scheduler,
                hostname,
                started_at: Utc::now(),
                accepting: AtomicBool::new(true),
                driving: DashSet::new(),
                retries: DashMap::new(),
                recoveries: DashMap::new(),
                background: Mutex::new(Vec::new()),
                background_stop: CancellationToken::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct PendingRetry {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner<R: WorkflowRepository> {
    runtime: Runtime<R>,
    scheduler: BoxScheduler,
    hostname: String,
    started_at: DateTime<Utc>,
    accepting: AtomicBool,
    /// Instances with a live driver in this process.
    driving: DashSet<i64>,
    retries: DashMap<i64, PendingRetry>,
    recoveries: DashMap<i64, JoinHandle<()>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    background_stop: CancellationToken,
}

/// Removes an instance from the driving set when its driver ends.
struct DrivingGuard<'a> {
    driving: &'a DashSet<i64>,
    instance_id: i64,
}

impl Drop for DrivingGuard<'_> {
    fn drop(&mut self) {
        self.driving.remove(&self.instance_id);
    }
}

/// Database-backed workflow engine. Cheap to clone; clones share state.
pub struct WorkflowEngine<R: WorkflowRepository> {
    inner: Arc<EngineInner<R>>,
}

impl<R: WorkflowRepository> Clone for WorkflowEngine<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    pub fn builder(repo: R) -> WorkflowEngineBuilder<R> {
        WorkflowEngineBuilder {
            repo,
            config: EngineConfig::default(),
            registry: None,
            resolver: None,
            locks: None,
            scheduler: None,
            events: None,
        }
    }

    fn rt(&self) -> &Runtime<R> {
        &self.inner.runtime
    }

    pub fn engine_id(&self) -> &str {
        &self.rt().engine_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.rt().config
    }

    pub fn repo(&self) -> &R {
        self.rt().repo()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.rt().events.subscribe()
    }

    pub fn slot_stats(&self) -> [SlotStats; 2] {
        self.rt().slots.stats()
    }

    /// Instances currently being driven by this engine.
    pub fn active_instances(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.driving.iter().map(|id| *id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    fn ensure_accepting(&self) -> Result<(), EngineError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(EngineError::ShuttingDown)
        }
    }

    // -----------------------------------------------------------------------
    // Definitions and read-throughs
    // -----------------------------------------------------------------------

    /// Validate and store a definition so instances can reference it by id.
    pub async fn register_definition(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        validate_definition(definition)?;
        self.repo().save_definition(definition).await?;
        tracing::info!(definition_id = %definition.id, version = %definition.version, "definition registered");
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: i64) -> Result<Option<WorkflowInstance>, EngineError> {
        Ok(self.repo().get_instance(instance_id).await?)
    }

    pub async fn list_nodes(&self, instance_id: i64) -> Result<Vec<NodeInstance>, EngineError> {
        Ok(self.repo().list_nodes(instance_id).await?)
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Start a stored definition by id (latest version unless pinned).
    pub async fn start_by_id(
        &self,
        definition_id: &str,
        version: Option<&str>,
        options: StartOptions,
    ) -> Result<WorkflowInstance, EngineError> {
        let definition = self
            .repo()
            .get_definition(definition_id, version)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow definition '{definition_id}'")))?;
        self.start_workflow(&definition, options).await
    }

    /// Create an instance of `definition` and drive it.
    ///
    /// Returns the instance as it stands when this drive ends: `completed`,
    /// `failed` (possibly with a retry scheduled), `paused`, or
    /// `cancelled`.
    pub async fn start_workflow(
        &self,
        definition: &WorkflowDefinition,
        options: StartOptions,
    ) -> Result<WorkflowInstance, EngineError> {
        self.ensure_accepting()?;
        validate_definition(definition)?;
        let inputs = materialize_inputs(definition, &options.inputs)?;
        let rt = self.rt();

        self.ensure_keys_free(options.business_key.as_deref(), options.mutex_key.as_deref(), None)
            .await?;
        if definition.config.singleton {
            let active = rt
                .repo()
                .check_instance_lock(&definition.id, &WorkflowStatus::TERMINAL)
                .await?;
            if !active.is_empty() {
                return Err(EngineError::InstanceLocked {
                    definition_id: definition.id.clone(),
                    instances: active.iter().map(|i| i.id).collect(),
                });
            }
        }

        rt.repo().save_definition(definition).await?;
        let created = rt
            .repo()
            .create_instance(&NewWorkflowInstance {
                definition_id: definition.id.clone(),
                definition_version: definition.version.clone(),
                input_data: inputs,
                business_key: options.business_key.clone(),
                mutex_key: options.mutex_key.clone(),
                external_id: options.external_id,
                parent_instance_id: None,
                parent_node_id: None,
                max_retries: options
                    .max_retries
                    .unwrap_or(definition.config.retry.max_retries),
                priority: definition.config.priority,
                assigned_engine_id: Some(rt.engine_id.clone()),
            })
            .await;
        let instance = match created {
            Ok(instance) => instance,
            // Lost a race for a key after the check above passed.
            Err(err @ RepositoryError::Conflict(_)) => {
                self.ensure_keys_free(options.business_key.as_deref(), options.mutex_key.as_deref(), None)
                    .await?;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        tracing::info!(
            instance_id = instance.id,
            definition_id = %definition.id,
            version = %definition.version,
            "workflow instance created"
        );

        if let Err(err) = rt.slots.request_slot(ResourceClass::Workflow, instance.id) {
            self.fail_before_start(instance.id, &err).await;
            return Err(err);
        }

        match self.launch(&instance, Arc::new(definition.clone())).await {
            Err(err @ EngineError::LockNotAcquired(_)) => {
                self.fail_before_start(instance.id, &err).await;
                Err(err)
            }
            other => other,
        }
    }

    /// Mark an instance that never started as failed.
    async fn fail_before_start(&self, instance_id: i64, err: &EngineError) {
        let details = ErrorDetails::new(ErrorClassifier::classify(err), err.to_string());
        if let Err(persist) = self
            .rt()
            .transition(instance_id, WorkflowStatus::Failed, Some(&details))
            .await
        {
            tracing::warn!(instance_id, error = %persist, "failed to mark instance failed");
        }
        self.rt().events.publish(EngineEvent::WorkflowFailed {
            instance_id,
            category: details.category,
            message: details.message,
        });
        tracing::warn!(instance_id, error = %err, "workflow could not start");
    }

    /// Activate, move to `running`, and drive. The caller holds the
    /// workflow slot; it is released on every exit path.
    async fn launch(
        &self,
        instance: &WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
    ) -> Result<WorkflowInstance, EngineError> {
        let rt = self.rt();
        let definition_id = definition.id.clone();
        if let Err(err) = rt.activate(instance, definition, 0).await {
            rt.slots.release_slot(ResourceClass::Workflow, instance.id);
            return Err(err);
        }
        if instance.status != WorkflowStatus::Running {
            if let Err(err) = rt
                .transition(instance.id, WorkflowStatus::Running, None)
                .await
            {
                rt.release_instance(instance.id).await;
                return Err(err);
            }
        }

        rt.events.publish(EngineEvent::WorkflowStarted {
            instance_id: instance.id,
            definition_id: definition_id.clone(),
        });
        tracing::info!(instance_id = instance.id, definition_id = %definition_id, "workflow started");
        self.execute(instance.id).await
    }

    /// One drive of an active, `running` instance plus its outcome
    /// handling. Boxed so retry tasks can call it recursively.
    fn execute(&self, instance_id: i64) -> BoxFuture<'static, Result<WorkflowInstance, EngineError>> {
        let this = self.clone();
        Box::pin(async move {
            if !this.inner.driving.insert(instance_id) {
                return Err(EngineError::Validation(format!(
                    "instance {instance_id} is already being driven by this engine"
                )));
            }
            let _driving = DrivingGuard {
                driving: &this.inner.driving,
                instance_id,
            };
            let rt = this.rt();

            match rt.drive(instance_id, instance_id).await {
                Ok(output) => match rt.complete(instance_id, &output).await {
                    Ok(()) => rt.release_instance(instance_id).await,
                    Err(EngineError::InvalidTransition { from, .. }) => {
                        tracing::info!(instance_id, status = %from, "workflow left running before completion");
                        rt.release_instance(instance_id).await;
                    }
                    Err(err) => this.handle_failure(instance_id, err).await?,
                },
                Err(EngineError::Interrupted(status)) => {
                    tracing::info!(instance_id, status = %status, "workflow drive stopped");
                    rt.release_instance(instance_id).await;
                }
                Err(err) => this.handle_failure(instance_id, err).await?,
            }

            rt.load_instance(instance_id).await
        })
    }

    // -----------------------------------------------------------------------
    // Failure and retry
    // -----------------------------------------------------------------------

    async fn handle_failure(&self, instance_id: i64, err: EngineError) -> Result<(), EngineError> {
        let rt = self.rt();
        let instance = rt.load_instance(instance_id).await?;
        let retry_config = rt
            .contexts
            .get(instance_id)
            .map(|ctx| lock_context(&ctx).definition.config.retry.clone())
            .unwrap_or_default();
        let policy = RetryPolicy::from_config(&retry_config).with_max_retries(instance.max_retries);
        let details = policy.error_details(&err, instance.retry_count);

        match rt
            .transition(instance_id, WorkflowStatus::Failed, Some(&details))
            .await
        {
            Ok(_) => {}
            Err(EngineError::InvalidTransition { from, .. }) => {
                tracing::info!(instance_id, status = %from, error = %err, "failure ignored; workflow already left running");
                rt.release_instance(instance_id).await;
                return Ok(());
            }
            Err(persist) => {
                rt.release_instance(instance_id).await;
                return Err(persist);
            }
        }
        rt.events.publish(EngineEvent::WorkflowFailed {
            instance_id,
            category: details.category,
            message: details.message.clone(),
        });

        if policy.should_retry(details.category, instance.retry_count) {
            let next = instance.retry_count + 1;
            rt.repo().update_retry_count(instance_id, next).await?;
            let delay = policy.backoff(instance.retry_count, details.severity);
            let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(
                instance_id,
                category = %details.category,
                retry_count = next,
                delay_ms,
                error = %details.message,
                "workflow failed; retry scheduled"
            );
            rt.events.publish(EngineEvent::RetryScheduled {
                instance_id,
                retry_count: next,
                delay_ms,
            });
            self.schedule_retry(instance_id, delay);
        } else {
            rt.release_instance(instance_id).await;
            if details.escalate {
                tracing::error!(
                    instance_id,
                    category = %details.category,
                    retry_count = instance.retry_count,
                    escalate = true,
                    error = %details.message,
                    "workflow failed and requires attention"
                );
                rt.events.publish(EngineEvent::Escalated {
                    instance_id,
                    category: details.category,
                    message: details.message,
                });
            } else {
                tracing::warn!(
                    instance_id,
                    category = %details.category,
                    error = %details.message,
                    "workflow failed"
                );
            }
        }
        Ok(())
    }

    /// Re-drive a failed instance after `delay`. The lock and workflow slot
    /// stay held during the backoff.
    fn schedule_retry(&self, instance_id: i64, delay: Duration) {
        let this = self.clone();
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    tracing::debug!(instance_id, "scheduled retry cancelled");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(err) = this.run_scheduled_retry(instance_id).await {
                tracing::warn!(instance_id, error = %err, "scheduled retry failed");
            }
        });
        self.inner
            .retries
            .insert(instance_id, PendingRetry { token, handle });
    }

    async fn run_scheduled_retry(&self, instance_id: i64) -> Result<(), EngineError> {
        let rt = self.rt();
        // The failed drive may still be unwinding when a short backoff ends.
        while self.inner.driving.contains(&instance_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let instance = rt.load_instance(instance_id).await?;
        if instance.status != WorkflowStatus::Failed || !self.is_accepting() {
            tracing::debug!(instance_id, status = %instance.status, "retry skipped");
            return Ok(());
        }

        if rt.contexts.get(instance_id).is_none() {
            let definition = rt.load_definition(&instance).await?;
            rt.activate(&instance, definition, 0).await?;
        } else {
            rt.acquire_instance_lock(instance_id).await?;
        }
        rt.slots.request_slot(ResourceClass::Workflow, instance_id)?;
        rt.transition(instance_id, WorkflowStatus::Running, None)
            .await?;
        tracing::info!(instance_id, retry_count = instance.retry_count, "retrying workflow");
        self.execute(instance_id).await.map(|_| ())
    }

    /// Cancel a scheduled retry. Returns whether one was still waiting.
    fn cancel_pending_retry(&self, instance_id: i64) -> bool {
        match self.inner.retries.remove(&instance_id) {
            Some((_, pending)) => {
                let waiting = !pending.handle.is_finished();
                pending.token.cancel();
                waiting
            }
            None => false,
        }
    }

    /// Wait until no retry is scheduled or running for `instance_id`.
    pub async fn wait_for_retries(&self, instance_id: i64) {
        while let Some((_, pending)) = self.inner.retries.remove(&instance_id) {
            if let Err(err) = pending.handle.await {
                tracing::warn!(instance_id, error = %err, "retry task ended abnormally");
            }
        }
    }

    /// Wait for a recovery started by [`Self::recover_interrupted`], then
    /// for any retries it scheduled.
    pub async fn wait_for_recovery(&self, instance_id: i64) {
        if let Some((_, handle)) = self.inner.recoveries.remove(&instance_id) {
            if let Err(err) = handle.await {
                tracing::warn!(instance_id, error = %err, "recovery task ended abnormally");
            }
        }
        self.wait_for_retries(instance_id).await;
    }

    // -----------------------------------------------------------------------
    // Lifecycle operations
    // -----------------------------------------------------------------------

    /// `running -> paused`. The driver stops at the next node boundary and
    /// releases the lock and slot.
    pub async fn pause_workflow(&self, instance_id: i64) -> Result<WorkflowInstance, EngineError> {
        let rt = self.rt();
        let instance = rt
            .transition(instance_id, WorkflowStatus::Paused, None)
            .await?;
        if !self.inner.driving.contains(&instance_id) {
            rt.release_instance(instance_id).await;
        }
        rt.events
            .publish(EngineEvent::WorkflowPaused { instance_id });
        tracing::info!(instance_id, "workflow paused");
        Ok(instance)
    }

    /// Cancel a non-terminal instance, or a failed one waiting for a retry.
    ///
    /// Cancellation is cooperative: a node already executing runs to
    /// completion and the driver stops at the next boundary.
    pub async fn cancel_workflow(&self, instance_id: i64) -> Result<WorkflowInstance, EngineError> {
        let rt = self.rt();
        let instance = rt.load_instance(instance_id).await?;
        let retry_pending = self.cancel_pending_retry(instance_id);
        let allowed = !instance.status.is_terminal()
            || (instance.status == WorkflowStatus::Failed && retry_pending);
        if !allowed {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                to: WorkflowStatus::Cancelled,
            });
        }

        rt.checkpoints
            .checkpoint_status(instance_id, WorkflowStatus::Cancelled, None)
            .await?;
        rt.contexts
            .set_status(instance_id, WorkflowStatus::Cancelled);
        if !self.inner.driving.contains(&instance_id) {
            rt.release_instance(instance_id).await;
        }
        rt.events
            .publish(EngineEvent::WorkflowCancelled { instance_id });
        tracing::info!(instance_id, from = %instance.status, "workflow cancelled");
        rt.load_instance(instance_id).await
    }

    /// Continue a `paused` instance, or a `pending`/`running` one whose
    /// driver is gone, from its last checkpoint.
    pub async fn resume_workflow(&self, instance_id: i64) -> Result<WorkflowInstance, EngineError> {
        self.ensure_accepting()?;
        let rt = self.rt();
        let instance = rt.load_instance(instance_id).await?;
        if !matches!(
            instance.status,
            WorkflowStatus::Paused | WorkflowStatus::Pending | WorkflowStatus::Running
        ) {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                to: WorkflowStatus::Running,
            });
        }
        if self.inner.driving.contains(&instance_id) {
            return Err(EngineError::Validation(format!(
                "instance {instance_id} is already being driven by this engine"
            )));
        }

        let definition = rt.load_definition(&instance).await?;
        rt.slots
            .request_slot(ResourceClass::Workflow, instance_id)?;
        tracing::info!(instance_id, from = %instance.status, "resuming workflow");
        self.launch(&instance, definition).await
    }

    /// Fail when an instance other than `except` holds either key.
    async fn ensure_keys_free(
        &self,
        business_key: Option<&str>,
        mutex_key: Option<&str>,
        except: Option<i64>,
    ) -> Result<(), EngineError> {
        let repo = self.rt().repo();
        let others = |holders: Vec<WorkflowInstance>| -> Vec<i64> {
            holders.iter().map(|i| i.id).filter(|id| Some(*id) != except).collect()
        };
        if let Some(key) = business_key {
            let instances = others(repo.check_business_instance_lock(key).await?);
            if !instances.is_empty() {
                return Err(EngineError::BusinessKeyConflict { key: key.to_string(), instances });
            }
        }
        if let Some(key) = mutex_key {
            let instances = others(repo.check_mutex_instance_lock(key).await?);
            if !instances.is_empty() {
                return Err(EngineError::MutexKeyConflict { key: key.to_string(), instances });
            }
        }
        Ok(())
    }

    /// Manually re-drive a `failed` instance that has retries left.
    pub async fn retry_workflow(&self, instance_id: i64) -> Result<WorkflowInstance, EngineError> {
        self.ensure_accepting()?;
        let rt = self.rt();
        let mut instance = rt.load_instance(instance_id).await?;
        if instance.status != WorkflowStatus::Failed {
            return Err(EngineError::InvalidTransition {
                from: instance.status,
                to: WorkflowStatus::Running,
            });
        }
        if !instance.can_retry() {
            return Err(EngineError::Validation(format!(
                "instance {instance_id} has used all {} retries",
                instance.max_retries
            )));
        }
        self.ensure_keys_free(
            instance.business_key.as_deref(),
            instance.mutex_key.as_deref(),
            Some(instance_id),
        )
        .await?;
        self.cancel_pending_retry(instance_id);

        instance.retry_count += 1;
        rt.repo()
            .update_retry_count(instance_id, instance.retry_count)
            .await?;
        let definition = rt.load_definition(&instance).await?;
        rt.slots
            .request_slot(ResourceClass::Workflow, instance_id)?;
        tracing::info!(instance_id, retry_count = instance.retry_count, "manual retry");
        self.launch(&instance, definition).await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Claim interrupted top-level instances assigned to this engine and
    /// resume them in the background.
    ///
    /// An instance is claimed only when the scheduler assigns it here and
    /// its lock can be taken, so concurrent passes on several engines
    /// resume each instance at most once. Returns the claimed ids.
    pub async fn recover_interrupted(&self, limit: u32) -> Result<Vec<i64>, EngineError> {
        self.ensure_accepting()?;
        let rt = self.rt();
        let candidates = rt
            .repo()
            .find_interrupted_instances(&[WorkflowStatus::Pending, WorkflowStatus::Running], limit)
            .await?;

        let mut claimed = Vec::new();
        for instance in candidates {
            let id = instance.id;
            if instance.parent_instance_id.is_some()
                || self.inner.driving.contains(&id)
                || self.inner.recoveries.contains_key(&id)
                || rt.slots.holds(ResourceClass::Workflow, id)
            {
                continue;
            }
            match self.inner.scheduler.assign_workflow(id).await? {
                Some(engine) if engine == rt.engine_id => {}
                _ => continue,
            }
            let key = workflow_lock_key(id);
            let acquired = rt
                .locks
                .acquire_lock(&key, &rt.engine_id, WORKFLOW_RESOURCE, rt.config.lock_ttl())
                .await?;
            if !acquired {
                tracing::debug!(instance_id = id, "interrupted instance is locked elsewhere");
                continue;
            }
            rt.repo().assign_engine(id, Some(&rt.engine_id)).await?;

            let this = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(err) = this.resume_workflow(id).await {
                    tracing::warn!(instance_id = id, error = %err, "recovery failed");
                    if !this.inner.driving.contains(&id) {
                        this.rt().release_instance(id).await;
                    }
                }
            });
            self.inner.recoveries.insert(id, handle);
            claimed.push(id);
        }

        if !claimed.is_empty() {
            tracing::info!(count = claimed.len(), instances = ?claimed, "recovering interrupted workflows");
        }
        Ok(claimed)
    }

    // -----------------------------------------------------------------------
    // Background maintenance
    // -----------------------------------------------------------------------

    fn engine_info(&self) -> EngineInfo {
        EngineInfo {
            instance_id: self.rt().engine_id.clone(),
            hostname: self.inner.hostname.clone(),
            load: self.current_load(),
            supported_executors: self.rt().registry.names(),
            last_heartbeat: Utc::now(),
            started_at: self.inner.started_at,
        }
    }

    fn current_load(&self) -> EngineLoad {
        let rt = self.rt();
        let workflows = rt.slots.class_stats(ResourceClass::Workflow);
        let nodes = rt.slots.class_stats(ResourceClass::Node);
        EngineLoad {
            active_workflows: u32::try_from(workflows.in_use).unwrap_or(u32::MAX),
            active_nodes: u32::try_from(nodes.in_use).unwrap_or(u32::MAX),
            cpu_estimate: workflows.in_use as f64 / workflows.capacity as f64,
            memory_estimate_mb: rt.contexts.payload_bytes() as f64 / (1024.0 * 1024.0),
        }
    }

    /// Report load to the scheduler and refresh `last_heartbeat` on every
    /// instance this engine is driving.
    pub async fn heartbeat(&self) -> Result<(), EngineError> {
        let rt = self.rt();
        match self
            .inner
            .scheduler
            .update_heartbeat(&rt.engine_id, &self.current_load())
            .await
        {
            Ok(()) => {}
            Err(SchedulerError::UnknownEngine(_)) => {
                tracing::info!(engine_id = %rt.engine_id, "engine unknown to scheduler; registering again");
                self.inner
                    .scheduler
                    .register_engine(&self.engine_info())
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }
        let ids = self.active_instances();
        if !ids.is_empty() {
            rt.repo().touch_heartbeat(&ids).await?;
        }
        Ok(())
    }

    /// Evict terminal contexts that have been idle past the configured
    /// timeout, releasing any lock they still hold. Returns the number
    /// evicted.
    pub async fn sweep(&self) -> usize {
        let rt = self.rt();
        self.inner.retries.retain(|_, r| !r.handle.is_finished());
        self.inner.recoveries.retain(|_, h| !h.is_finished());

        let mut evicted = 0;
        for id in rt.contexts.evictable(rt.config.context_idle_timeout()) {
            if self.inner.retries.contains_key(&id) || self.inner.driving.contains(&id) {
                continue;
            }
            let key = workflow_lock_key(id);
            if let Err(err) = rt.locks.release_lock(&key, &rt.engine_id).await {
                tracing::warn!(instance_id = id, error = %err, "failed to release lock of evicted context");
            }
            rt.contexts.remove(id);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, remaining = rt.contexts.len(), "swept idle contexts");
        }
        evicted
    }

    /// Register with the scheduler and spawn the heartbeat, sweep, and
    /// recovery loops.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.ensure_accepting()?;
        self.inner
            .scheduler
            .register_engine(&self.engine_info())
            .await?;

        let config = &self.rt().config;
        let loops = [
            (Loop::Heartbeat, config.heartbeat_interval()),
            (Loop::Sweep, config.sweep_interval()),
            (Loop::Recovery, config.recovery_interval()),
        ];
        let handles: Vec<JoinHandle<()>> = loops
            .into_iter()
            .map(|(kind, period)| self.spawn_loop(kind, period))
            .collect();
        self.inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        tracing::info!(
            engine_id = %self.rt().engine_id,
            hostname = %self.inner.hostname,
            "engine started"
        );
        Ok(())
    }

    fn spawn_loop(&self, kind: Loop, period: Duration) -> JoinHandle<()> {
        let this = self.clone();
        let stop = self.inner.background_stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match kind {
                    Loop::Heartbeat => {
                        if let Err(err) = this.heartbeat().await {
                            tracing::warn!(error = %err, "heartbeat failed");
                        }
                    }
                    Loop::Sweep => {
                        this.sweep().await;
                    }
                    Loop::Recovery => {
                        let limit = this.rt().config.recovery_batch_limit;
                        if let Err(err) = this.recover_interrupted(limit).await {
                            tracing::warn!(error = %err, "recovery pass failed");
                        }
                    }
                }
            }
            tracing::debug!(task = ?kind, "background loop stopped");
        })
    }

    /// Stop accepting work, wait (bounded) for in-flight drives to reach a
    /// safe point, then stop background tasks, release every lock and
    /// slot, and unregister from the scheduler. Instances still running
    /// when the timeout expires are left for recovery.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let rt = self.rt();
        if !inner.accepting.swap(false, Ordering::SeqCst) {
            tracing::debug!("engine already shut down");
            return;
        }
        tracing::info!(engine_id = %rt.engine_id, "engine shutting down");

        for pending in inner.retries.iter() {
            pending.token.cancel();
        }

        let deadline = Instant::now() + rt.config.shutdown_timeout();
        loop {
            let in_flight = self.active_instances();
            if in_flight.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    count = in_flight.len(),
                    instances = ?in_flight,
                    "shutdown timeout reached; interrupting in-flight workflows"
                );
                rt.stop.cancel();
                for recovery in inner.recoveries.iter() {
                    recovery.abort();
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        inner.background_stop.cancel();
        let background: Vec<JoinHandle<()>> = std::mem::take(
            &mut *inner
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in background {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }

        rt.locks.disable_all_renewals();
        for id in rt.contexts.ids() {
            match rt.locks.release_lock(&workflow_lock_key(id), &rt.engine_id).await {
                Ok(true) => {
                    if let Err(err) = rt.repo().update_lock_info(id, None).await {
                        tracing::warn!(instance_id = id, error = %err, "failed to clear lock owner");
                    }
                }
                Ok(false) => {}
                Err(err) => tracing::warn!(instance_id = id, error = %err, "failed to release lock"),
            }
        }
        rt.slots.release_all();
        if let Err(err) = inner.scheduler.unregister_engine(&rt.engine_id).await {
            tracing::warn!(error = %err, "failed to unregister engine");
        }
        rt.contexts.clear();
        inner.retries.clear();
        inner.recoveries.clear();
        tracing::info!(engine_id = %rt.engine_id, "engine stopped");
    }
}

#[derive(Debug, Clone, Copy)]
enum Loop {
    Heartbeat,
    Sweep,
    Recovery,
}

impl<R: WorkflowRepository> std::fmt::Debug for WorkflowEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("engine_id", &self.inner.runtime.engine_id)
            .field("accepting", &self.inner.accepting.load(Ordering::SeqCst))
            .field("driving", &self.inner.driving.len())
            .finish_non_exhaustive()
    }
}

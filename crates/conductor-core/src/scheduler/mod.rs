//! Distributed scheduler contract.
//!
//! Engines register on startup, heartbeat their load, and deregister on
//! shutdown. Assignment picks the least-loaded engine among those whose
//! heartbeat is fresh (and, for nodes, that support every required
//! executor). Workflow assignment is sticky while the assigned engine stays
//! alive.

pub mod memory;

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_types::engine::{EngineInfo, EngineLoad};

pub use memory::InMemoryScheduler;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler backend error: {0}")]
    Backend(String),

    #[error("engine '{0}' is not registered")]
    UnknownEngine(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait DistributedScheduler: Send + Sync {
    fn register_engine(&self, info: &EngineInfo) -> impl Future<Output = Result<(), SchedulerError>> + Send;

    fn unregister_engine(&self, engine_id: &str) -> impl Future<Output = Result<(), SchedulerError>> + Send;

    fn update_heartbeat(
        &self,
        engine_id: &str,
        load: &EngineLoad,
    ) -> impl Future<Output = Result<(), SchedulerError>> + Send;

    /// Engine that should drive `instance_id`, or `None` if no engine is alive.
    fn assign_workflow(
        &self,
        instance_id: i64,
    ) -> impl Future<Output = Result<Option<String>, SchedulerError>> + Send;

    /// Engine that should run `node_id`, restricted to engines supporting
    /// every executor in `capabilities`.
    fn assign_node(
        &self,
        instance_id: i64,
        node_id: &str,
        capabilities: &[String],
    ) -> impl Future<Output = Result<Option<String>, SchedulerError>> + Send;

    fn list_engines(&self) -> impl Future<Output = Result<Vec<EngineInfo>, SchedulerError>> + Send;
}

/// Object-safe version of [`DistributedScheduler`] with boxed futures.
pub trait SchedulerDyn: Send + Sync {
    fn register_engine_boxed<'a>(
        &'a self,
        info: &'a EngineInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send + 'a>>;

    fn unregister_engine_boxed<'a>(
        &'a self,
        engine_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send + 'a>>;

    fn update_heartbeat_boxed<'a>(
        &'a self,
        engine_id: &'a str,
        load: &'a EngineLoad,
    ) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send + 'a>>;

    fn assign_workflow_boxed<'a>(
        &'a self,
        instance_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, SchedulerError>> + Send + 'a>>;

    fn assign_node_boxed<'a>(
        &'a self,
        instance_id: i64,
        node_id: &'a str,
        capabilities: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, SchedulerError>> + Send + 'a>>;

    fn list_engines_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EngineInfo>, SchedulerError>> + Send + 'a>>;
}

/// Blanket implementation: any `DistributedScheduler` automatically implements `SchedulerDyn`.
impl<T: DistributedScheduler> SchedulerDyn for T {
    fn register_engine_boxed<'a>(
        &'a self,
        info: &'a EngineInfo,
    ) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send + 'a>> {
        Box::pin(self.register_engine(info))
    }

    fn unregister_engine_boxed<'a>(
        &'a self,
        engine_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send + 'a>> {
        Box::pin(self.unregister_engine(engine_id))
    }

    fn update_heartbeat_boxed<'a>(
        &'a self,
        engine_id: &'a str,
        load: &'a EngineLoad,
    ) -> Pin<Box<dyn Future<Output = Result<(), SchedulerError>> + Send + 'a>> {
        Box::pin(self.update_heartbeat(engine_id, load))
    }

    fn assign_workflow_boxed<'a>(
        &'a self,
        instance_id: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, SchedulerError>> + Send + 'a>> {
        Box::pin(self.assign_workflow(instance_id))
    }

    fn assign_node_boxed<'a>(
        &'a self,
        instance_id: i64,
        node_id: &'a str,
        capabilities: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, SchedulerError>> + Send + 'a>> {
        Box::pin(self.assign_node(instance_id, node_id, capabilities))
    }

    fn list_engines_boxed<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EngineInfo>, SchedulerError>> + Send + 'a>> {
        Box::pin(self.list_engines())
    }
}

/// Type-erased scheduler. Cheap to clone.
#[derive(Clone)]
pub struct BoxScheduler {
    inner: Arc<dyn SchedulerDyn>,
}

impl BoxScheduler {
    pub fn new<S: DistributedScheduler + 'static>(scheduler: S) -> Self {
        Self {
            inner: Arc::new(scheduler),
        }
    }

    pub async fn register_engine(&self, info: &EngineInfo) -> Result<(), SchedulerError> {
        self.inner.register_engine_boxed(info).await
    }

    pub async fn unregister_engine(&self, engine_id: &str) -> Result<(), SchedulerError> {
        self.inner.unregister_engine_boxed(engine_id).await
    }

    pub async fn update_heartbeat(&self, engine_id: &str, load: &EngineLoad) -> Result<(), SchedulerError> {
        self.inner.update_heartbeat_boxed(engine_id, load).await
    }

    pub async fn assign_workflow(&self, instance_id: i64) -> Result<Option<String>, SchedulerError> {
        self.inner.assign_workflow_boxed(instance_id).await
    }

    pub async fn assign_node(
        &self,
        instance_id: i64,
        node_id: &str,
        capabilities: &[String],
    ) -> Result<Option<String>, SchedulerError> {
        self.inner
            .assign_node_boxed(instance_id, node_id, capabilities)
            .await
    }

    pub async fn list_engines(&self) -> Result<Vec<EngineInfo>, SchedulerError> {
        self.inner.list_engines_boxed().await
    }
}

impl std::fmt::Debug for BoxScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxScheduler").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// Whether `engine` heartbeated within `stale_after` of `now`.
pub fn is_alive(engine: &EngineInfo, now: DateTime<Utc>, stale_after: Duration) -> bool {
    let age = now.signed_duration_since(engine.last_heartbeat);
    age.to_std().map_or(true, |age| age <= stale_after)
}

/// Least-loaded live engine supporting `capabilities`.
///
/// Ordered by active workflow count, then CPU estimate, then id.
pub fn select_engine<'a>(
    engines: &'a [EngineInfo],
    capabilities: &[String],
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Option<&'a EngineInfo> {
    engines
        .iter()
        .filter(|e| is_alive(e, now, stale_after) && e.supports(capabilities))
        .min_by(|a, b| {
            a.load
                .active_workflows
                .cmp(&b.load.active_workflows)
                .then_with(|| {
                    a.load
                        .cpu_estimate
                        .partial_cmp(&b.load.cpu_estimate)
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        })
}

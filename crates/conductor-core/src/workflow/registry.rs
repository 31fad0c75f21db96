//! Executor registry for task nodes.
//!
//! Task nodes name an executor (`executor: http_fetch`); the registry maps
//! that name to an implementation. The registry is built once and injected
//! into the engine at construction.
//!
//! Follows the same blanket-impl pattern as the other dynamic-dispatch
//! wrappers in this crate:
//! 1. `TaskExecutor` uses native async fn in traits
//! 2. Object-safe `TaskExecutorDyn` returns boxed futures
//! 3. Blanket-impl `TaskExecutorDyn` for all `T: TaskExecutor`

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conductor_types::error::ErrorCategory;
use serde_json::Value;

use super::error::EngineError;

// ---------------------------------------------------------------------------
// TaskContext / TaskError
// ---------------------------------------------------------------------------

/// Everything an executor receives for one invocation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub instance_id: i64,
    pub node_id: String,
    pub node_instance_id: i64,
    /// Zero on the first attempt of the workflow.
    pub attempt: u32,
    /// Node configuration with `${...}` templates already resolved.
    pub config: Value,
    /// Assembled node input (workflow input, dependency outputs, loop item).
    pub input: Value,
}

/// Failure reported by an executor.
///
/// Executors may classify their own failures; unclassified failures are
/// classified from the message by the engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub category: Option<ErrorCategory>,
    pub details: Option<Value>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: None,
            details: None,
        }
    }

    pub fn with_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: Some(category),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// Executor traits
// ---------------------------------------------------------------------------

/// A named unit of work invoked by task nodes and loop iterations.
///
/// Timeouts are the executor's responsibility; the engine never interrupts
/// a running executor.
pub trait TaskExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &TaskContext,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send;
}

/// Object-safe version of [`TaskExecutor`] with boxed futures.
pub trait TaskExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>>;
}

/// Blanket implementation: any `TaskExecutor` automatically implements `TaskExecutorDyn`.
impl<T: TaskExecutor> TaskExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a TaskContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, TaskError>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }
}

/// Adapts an async closure into a [`TaskExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F, Fut> TaskExecutor for FnExecutor<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, TaskError>> + Send,
{
    fn execute(
        &self,
        ctx: &TaskContext,
    ) -> impl Future<Output = Result<Value, TaskError>> + Send {
        (self.f)(ctx.clone())
    }
}

// ---------------------------------------------------------------------------
// ExecutorRegistry
// ---------------------------------------------------------------------------

/// Name -> executor map. Cheap to clone; executors are shared.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutorDyn>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in executors
    /// (see [`super::builtin`]).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) an executor under `name`.
    pub fn register<E: TaskExecutor + 'static>(&mut self, name: impl Into<String>, executor: E) -> &mut Self {
        self.executors.insert(name.into(), Arc::new(executor));
        self
    }

    /// Register an async closure as an executor.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register(name, FnExecutor { f })
    }

    /// Resolve an executor by name.
    pub fn get_executor(&self, name: &str) -> Result<Arc<dyn TaskExecutorDyn>, EngineError> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ExecutorNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.executors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(config: Value) -> TaskContext {
        TaskContext {
            instance_id: 1,
            node_id: "a".to_string(),
            node_instance_id: 1,
            attempt: 0,
            config,
            input: json!({}),
        }
    }

    #[tokio::test]
    async fn register_fn_and_execute() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("double", |ctx: TaskContext| async move {
            let n = ctx.config["n"].as_i64().unwrap_or(0);
            Ok::<_, TaskError>(json!(n * 2))
        });

        let exec = registry.get_executor("double").unwrap();
        let out = exec.execute_boxed(&ctx(json!({"n": 21}))).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[test]
    fn missing_executor_is_executor_not_found() {
        let registry = ExecutorRegistry::new();
        match registry.get_executor("nope") {
            Err(EngineError::ExecutorNotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("expected ExecutorNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ExecutorRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["delay", "echo", "fail", "items"]);
    }
}

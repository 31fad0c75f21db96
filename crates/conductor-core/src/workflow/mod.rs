//! Workflow engine: definition handling, execution, and durable state.
//!
//! - `definition` -- YAML/JSON parsing, structural validation, input defaults
//! - `dag` -- execution order and cycle detection
//! - `expression` -- JEXL evaluation and `${...}` config templates
//! - `registry` / `builtin` -- task executors
//! - `retry` -- error classification and backoff policy
//! - `context` -- per-instance in-memory execution state
//! - `checkpoint` -- durable state transitions
//! - `engine` -- `WorkflowEngine`, the public entry point

pub mod builtin;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
mod driver;
pub mod engine;
pub mod error;
pub mod expression;
mod nodes;
pub mod registry;
pub mod retry;
mod runtime;

pub use engine::{StartOptions, WorkflowEngine, WorkflowEngineBuilder};
pub use error::EngineError;
pub use registry::{ExecutorRegistry, TaskContext, TaskError, TaskExecutor};
pub use runtime::WORKFLOW_RESOURCE;

//! Built-in executors available to every engine.
//!
//! - `echo`: returns its config, or its input when the config is empty.
//! - `delay`: sleeps `config.ms` milliseconds, then behaves like `echo`.
//! - `items`: returns `config.items`, which must be an array. Useful as a
//!   loop data source.
//! - `fail`: fails with `config.message` and optional `config.category`.

use std::time::Duration;

use conductor_types::error::ErrorCategory;
use serde_json::Value;

use super::registry::{ExecutorRegistry, TaskContext, TaskError, TaskExecutor};

pub(crate) fn register_builtins(registry: &mut ExecutorRegistry) {
    registry
        .register("echo", EchoExecutor)
        .register("delay", DelayExecutor)
        .register("items", ItemsExecutor)
        .register("fail", FailExecutor);
}

fn echo(ctx: &TaskContext) -> Value {
    match &ctx.config {
        Value::Null => ctx.input.clone(),
        Value::Object(map) if map.is_empty() => ctx.input.clone(),
        config => config.clone(),
    }
}

pub struct EchoExecutor;

impl TaskExecutor for EchoExecutor {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        Ok(echo(ctx))
    }
}

pub struct DelayExecutor;

impl TaskExecutor for DelayExecutor {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let ms = ctx.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        let mut out = echo(ctx);
        if let Value::Object(map) = &mut out {
            map.remove("ms");
        }
        Ok(out)
    }
}

pub struct ItemsExecutor;

impl TaskExecutor for ItemsExecutor {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        match ctx.config.get("items") {
            Some(Value::Array(items)) => Ok(Value::Array(items.clone())),
            Some(other) => Err(TaskError::with_category(
                ErrorCategory::Validation,
                format!("'items' must be an array, got {other}"),
            )),
            None => Err(TaskError::with_category(
                ErrorCategory::Validation,
                "missing 'items' in executor config",
            )),
        }
    }
}

pub struct FailExecutor;

impl TaskExecutor for FailExecutor {
    async fn execute(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let message = ctx
            .config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("task failed")
            .to_string();
        let category = ctx
            .config
            .get("category")
            .cloned()
            .and_then(|c| serde_json::from_value::<ErrorCategory>(c).ok());
        Err(TaskError {
            message,
            category,
            details: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(config: Value, input: Value) -> TaskContext {
        TaskContext {
            instance_id: 1,
            node_id: "n".to_string(),
            node_instance_id: 1,
            attempt: 0,
            config,
            input,
        }
    }

    #[tokio::test]
    async fn echo_prefers_config_over_input() {
        let out = EchoExecutor
            .execute(&ctx(json!({"a": 1}), json!({"b": 2})))
            .await
            .unwrap();
        assert_eq!(out, json!({"a": 1}));

        let out = EchoExecutor.execute(&ctx(Value::Null, json!({"b": 2}))).await.unwrap();
        assert_eq!(out, json!({"b": 2}));
    }

    #[tokio::test]
    async fn items_requires_array() {
        let out = ItemsExecutor
            .execute(&ctx(json!({"items": [1, 2]}), Value::Null))
            .await
            .unwrap();
        assert_eq!(out, json!([1, 2]));

        let err = ItemsExecutor
            .execute(&ctx(json!({"items": 3}), Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.category, Some(ErrorCategory::Validation));
    }

    #[tokio::test]
    async fn fail_carries_category() {
        let err = FailExecutor
            .execute(&ctx(
                json!({"message": "db down", "category": "connection"}),
                Value::Null,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.message, "db down");
        assert_eq!(err.category, Some(ErrorCategory::Connection));
    }

    #[tokio::test]
    async fn delay_strips_ms_from_output() {
        let out = DelayExecutor
            .execute(&ctx(json!({"ms": 1, "value": "x"}), Value::Null))
            .await
            .unwrap();
        assert_eq!(out, json!({"value": "x"}));
    }
}

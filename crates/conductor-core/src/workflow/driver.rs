//! Drives one workflow instance through its top-level nodes.
//!
//! The driver resolves the node order, skips nodes whose rows are already
//! `completed`, and runs the rest one at a time. Before every node it
//! re-reads the instance status, so pause and cancel take effect at the
//! next node boundary. After every node it persists the checkpoint.

use std::time::Instant;

use conductor_types::error::ErrorCategory;
use conductor_types::node::{NewNodeInstance, NodeStatus};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};

use crate::repository::workflow::WorkflowRepository;

use super::context::lock_context;
use super::dag;
use super::error::EngineError;
use super::nodes::Scope;
use super::runtime::Runtime;

impl<R: WorkflowRepository + 'static> Runtime<R> {
    /// Run every remaining top-level node of `instance_id`.
    ///
    /// Requires an active context (see [`Runtime::activate`]). Returns the
    /// map of node id to output once every node has completed and the
    /// instance is still `running`. `root_id` is the top-level instance
    /// whose status also gates sub-workflow execution.
    pub(crate) fn drive(
        &self,
        instance_id: i64,
        root_id: i64,
    ) -> BoxFuture<'_, Result<Value, EngineError>> {
        Box::pin(async move {
            let ctx = self.contexts.get(instance_id).ok_or_else(|| {
                EngineError::NotFound(format!("execution context for instance {instance_id}"))
            })?;
            let (definition, depth) = {
                let guard = lock_context(&ctx);
                (guard.definition.clone(), guard.depth)
            };
            let instance = self.load_instance(instance_id).await?;
            let scope = Scope {
                instance_id,
                root_id,
                depth,
                attempt: instance.retry_count,
            };

            let order = dag::resolve_order(&definition.nodes, &definition.connections)?;
            let persisted = self.repo().list_nodes(instance_id).await?;
            {
                let mut guard = lock_context(&ctx);
                for row in persisted.iter().filter(|r| {
                    r.parent_node_id.is_none() && r.status == NodeStatus::Completed
                }) {
                    if guard.output(&row.node_id).is_none() {
                        guard.record_completed(&row.node_id, row.output_data.clone().unwrap_or(Value::Null));
                    }
                }
            }
            let remaining = dag::pending_from_checkpoint(order, &persisted);
            tracing::debug!(
                instance_id,
                remaining = remaining.len(),
                attempt = scope.attempt,
                "driving workflow"
            );

            for node in remaining {
                self.check_running(instance_id, root_id).await?;

                let deps = definition.dependencies_of(&node.id);
                let mut new = NewNodeInstance::new(
                    instance_id,
                    node.id.clone(),
                    node.display_name(),
                    node.node_type(),
                );
                new.depends_on = deps.clone();
                new.max_retries = node.max_retries.unwrap_or(instance.max_retries);
                let row = self.repo().create_node(&new).await?;

                let result = match self.wait_for_dependencies(instance_id, &node.id, &deps).await {
                    Ok(dep_outputs) => {
                        let vars = lock_context(&ctx).variables();
                        let input = json!({
                            "input": vars["input"].clone(),
                            "nodes": dep_outputs,
                        });
                        self.run_node(&scope, row, node, input, vars).await
                    }
                    // The row never started; record why it cannot.
                    Err(err) => Err(self.fail_node(&scope, &row, err, 0).await),
                };

                match result {
                    Ok(output) => {
                        let checkpoint = {
                            let mut guard = lock_context(&ctx);
                            guard.record_completed(&node.id, output);
                            guard.checkpoint()
                        };
                        self.checkpoints
                            .checkpoint_instance(instance_id, &checkpoint)
                            .await?;
                    }
                    Err(EngineError::Interrupted(status)) => {
                        tracing::info!(instance_id, node_id = %node.id, status = %status, "workflow interrupted");
                        return Err(EngineError::Interrupted(status));
                    }
                    Err(err) => {
                        let checkpoint = {
                            let mut guard = lock_context(&ctx);
                            guard.record_failed(&node.id);
                            guard.checkpoint()
                        };
                        if let Err(persist) = self
                            .checkpoints
                            .checkpoint_instance(instance_id, &checkpoint)
                            .await
                        {
                            tracing::warn!(instance_id, error = %persist, "failed to checkpoint after node failure");
                        }
                        return Err(err);
                    }
                }
            }

            self.check_running(instance_id, root_id).await?;
            let output = lock_context(&ctx).outputs();
            Ok(output)
        })
    }

    /// Wait until every dependency row of `node_id` has completed and return
    /// their outputs.
    ///
    /// A dependency that ended in any other terminal status fails the
    /// node; one that is still unfinished after the configured wait fails
    /// with a timeout.
    async fn wait_for_dependencies(
        &self,
        instance_id: i64,
        node_id: &str,
        deps: &[String],
    ) -> Result<Map<String, Value>, EngineError> {
        let started = Instant::now();
        loop {
            let mut outputs = Map::new();
            let mut waiting_on = None;
            for dep in deps {
                match self.repo().find_by_node_id(instance_id, dep).await? {
                    Some(row) if row.status == NodeStatus::Completed => {
                        outputs.insert(dep.clone(), row.output_data.unwrap_or(Value::Null));
                    }
                    Some(row) if row.status.is_terminal() => {
                        return Err(EngineError::NodeFailed {
                            node_id: node_id.to_string(),
                            message: format!("dependency '{dep}' is {}", row.status),
                            category: ErrorCategory::BusinessLogic,
                            output: None,
                        });
                    }
                    _ => {
                        waiting_on = Some(dep.as_str());
                        break;
                    }
                }
            }

            let Some(dep) = waiting_on else {
                return Ok(outputs);
            };
            if started.elapsed() >= self.config.dependency_wait_timeout() {
                return Err(EngineError::Timeout(format!(
                    "node '{node_id}' timed out waiting for dependency '{dep}'"
                )));
            }
            tracing::debug!(instance_id, node_id, dependency = dep, "waiting for dependency");
            tokio::time::sleep(self.config.dependency_poll_interval()).await;
        }
    }
}

//! Node executors.
//!
//! [`Runtime::run_node`] owns the node lifecycle (start checkpoint,
//! events, completion or failure checkpoint) and dispatches on the node
//! kind. Composite kinds recurse back into `run_node` for their children,
//! so every child gets the same durable lifecycle as a top-level node.

mod condition;
mod loop_node;
mod parallel;
mod subprocess;
mod task;

use std::time::Instant;

use conductor_types::definition::{NodeDefinition, NodeKind};
use conductor_types::error::ErrorDetails;
use conductor_types::event::EngineEvent;
use conductor_types::node::{
    NewNodeInstance, NodeInstance, NodeStatus, condition_child_id, parallel_child_id,
};
use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};

use crate::repository::workflow::WorkflowRepository;

use super::error::EngineError;
use super::retry::ErrorClassifier;
use super::runtime::Runtime;

/// Execution coordinates shared by every node of one drive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Scope {
    pub instance_id: i64,
    /// Top-level instance; equal to `instance_id` outside sub-workflows.
    pub root_id: i64,
    pub depth: u32,
    /// Retry count of the instance when this drive started.
    pub attempt: u32,
}

/// Where a sequence of child nodes sits inside its composite parent.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Placement {
    Branch(usize),
    Condition(bool),
}

impl Placement {
    fn child_id(self, parent: &str, node_id: &str) -> String {
        match self {
            Placement::Branch(branch) => parallel_child_id(parent, branch, node_id),
            Placement::Condition(branch) => condition_child_id(parent, branch, node_id),
        }
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

impl<R: WorkflowRepository + 'static> Runtime<R> {
    /// Execute one node row through its full lifecycle.
    ///
    /// A row that is already `completed` returns its stored output without
    /// running again. Failures come back as [`EngineError::NodeFailed`]
    /// naming this row; interruptions put the row back to `pending`.
    pub(crate) fn run_node<'a>(
        &'a self,
        scope: &'a Scope,
        row: NodeInstance,
        node: &'a NodeDefinition,
        input: Value,
        vars: Value,
    ) -> BoxFuture<'a, Result<Value, EngineError>> {
        Box::pin(async move {
            if row.status == NodeStatus::Completed {
                return Ok(row.output_data.unwrap_or(Value::Null));
            }

            self.checkpoints
                .checkpoint_node_start(row.id, &input, scope.attempt)
                .await?;
            self.events.publish(EngineEvent::NodeStarted {
                instance_id: scope.instance_id,
                node_id: row.node_id.clone(),
                node_type: row.node_type,
            });
            tracing::debug!(
                instance_id = scope.instance_id,
                node_id = %row.node_id,
                node_type = %row.node_type,
                "node started"
            );

            let started = Instant::now();
            let result = match &node.kind {
                NodeKind::Task(task) => self.execute_task(scope, &row, task, &input, &vars).await,
                NodeKind::Loop(lp) => self.execute_loop(scope, &row, lp, &input, &vars).await,
                NodeKind::Parallel(par) => self.execute_parallel(scope, &row, par, &vars).await,
                NodeKind::Condition(cond) => self.execute_condition(scope, &row, cond, &vars).await,
                NodeKind::Subprocess(sub) => {
                    self.execute_subprocess(scope, &row, sub, &vars).await
                }
            };
            let duration_ms = elapsed_ms(started);

            match result {
                Ok(output) => {
                    self.checkpoints
                        .checkpoint_node_complete(row.id, &output, duration_ms)
                        .await?;
                    self.events.publish(EngineEvent::NodeCompleted {
                        instance_id: scope.instance_id,
                        node_id: row.node_id.clone(),
                        duration_ms,
                    });
                    tracing::debug!(
                        instance_id = scope.instance_id,
                        node_id = %row.node_id,
                        duration_ms,
                        "node completed"
                    );
                    Ok(output)
                }
                Err(EngineError::Interrupted(status)) => {
                    if let Err(err) = self.checkpoints.checkpoint_node_interrupted(row.id).await {
                        tracing::warn!(node_id = %row.node_id, error = %err, "failed to reset interrupted node");
                    }
                    Err(EngineError::Interrupted(status))
                }
                Err(err) => Err(self.fail_node(scope, &row, err, duration_ms).await),
            }
        })
    }

    /// Persist a node failure and turn it into `NodeFailed` for this row.
    pub(crate) async fn fail_node(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        err: EngineError,
        duration_ms: i64,
    ) -> EngineError {
        let category = ErrorClassifier::classify(&err);
        let (message, output) = match err {
            EngineError::NodeFailed {
                node_id,
                message,
                output,
                ..
            } if node_id == row.node_id => (message, output),
            other => (other.to_string(), None),
        };

        let mut details = ErrorDetails::new(category, message.clone()).with_node(row.node_id.clone());
        details.retry_count = scope.attempt;
        if let Err(persist) = self
            .checkpoints
            .checkpoint_node_failed(row.id, &details, output.clone(), duration_ms)
            .await
        {
            tracing::warn!(node_id = %row.node_id, error = %persist, "failed to checkpoint node failure");
        }

        self.events.publish(EngineEvent::NodeFailed {
            instance_id: scope.instance_id,
            node_id: row.node_id.clone(),
            message: message.clone(),
        });
        tracing::warn!(
            instance_id = scope.instance_id,
            node_id = %row.node_id,
            category = %category,
            error = %message,
            "node failed"
        );

        EngineError::NodeFailed {
            node_id: row.node_id.clone(),
            message,
            category,
            output,
        }
    }

    /// Run `nodes` one after another as children of `parent`.
    ///
    /// Returns their outputs keyed by local node id. Each completed output
    /// is visible to later siblings as `nodes.<id>`.
    pub(crate) async fn run_sequence(
        &self,
        scope: &Scope,
        parent: &NodeInstance,
        nodes: &[NodeDefinition],
        placement: Placement,
        mut vars: Value,
    ) -> Result<Map<String, Value>, EngineError> {
        let mut outputs = Map::new();
        for node in nodes {
            self.check_running(scope.instance_id, scope.root_id).await?;

            let mut new = NewNodeInstance::new(
                scope.instance_id,
                placement.child_id(&parent.node_id, &node.id),
                node.display_name(),
                node.node_type(),
            );
            new.parent_node_id = Some(parent.node_id.clone());
            new.max_retries = node.max_retries.unwrap_or(parent.max_retries);
            if let Placement::Branch(branch) = placement {
                new.parallel_index = u32::try_from(branch).ok();
                new.parallel_group_id = Some(parent.node_id.clone());
            }
            let row = self.repo().create_node(&new).await?;

            let input = json!({
                "input": vars["input"].clone(),
                "nodes": Value::Object(outputs.clone()),
            });
            let output = self.run_node(scope, row, node, input, vars.clone()).await?;

            if let Some(visible) = vars.get_mut("nodes").and_then(Value::as_object_mut) {
                visible.insert(node.id.clone(), output.clone());
            }
            outputs.insert(node.id.clone(), output);
        }
        Ok(outputs)
    }
}

//! Loop nodes: two-phase, restart-safe iteration.
//!
//! Phase one materializes the item list and creates one child row per
//! item together with the `executing` progress marker, in a single
//! transaction. Phase two repeatedly fetches a batch of unfinished
//! children and runs them, serially or with bounded concurrency. A
//! restarted loop skips phase one and only runs children that have not
//! completed.

use conductor_types::definition::{
    DataSource, JoinPolicy, LoopErrorPolicy, LoopMode, LoopNode, NodeDefinition, NodeKind,
};
use conductor_types::error::ErrorCategory;
use conductor_types::node::{
    LoopPhase, LoopProgress, NewNodeInstance, NodeInstance, NodeStatus, NodeType, loop_child_id,
};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use serde_json::{Value, json};

use crate::repository::workflow::WorkflowRepository;
use crate::workflow::error::EngineError;
use crate::workflow::expression::ExpressionResolver;
use crate::workflow::runtime::Runtime;

use super::Scope;

impl<R: WorkflowRepository + 'static> Runtime<R> {
    pub(super) async fn execute_loop(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        node: &LoopNode,
        input: &Value,
        vars: &Value,
    ) -> Result<Value, EngineError> {
        let mut progress = row.loop_progress.unwrap_or_default();

        if progress.status == LoopPhase::Creating {
            let items = self.loop_items(scope, row, node, input, vars).await?;
            let children: Vec<NewNodeInstance> = items
                .into_iter()
                .enumerate()
                .map(|(index, item)| loop_child(scope.instance_id, row, index, item))
                .collect();
            progress = self
                .checkpoints
                .checkpoint_loop_children(row.id, children)
                .await?;
            tracing::debug!(
                instance_id = scope.instance_id,
                node_id = %row.node_id,
                total = progress.total_count,
                "loop children created"
            );
        } else {
            // Re-run of a failed loop: failed and skipped iterations get
            // another attempt, completed ones keep their output.
            for from in [NodeStatus::Failed, NodeStatus::Skipped] {
                self.repo()
                    .update_child_status(scope.instance_id, &row.node_id, from, NodeStatus::Pending)
                    .await?;
            }
        }

        let batch_size = u32::try_from(node.batch_size.max(1)).unwrap_or(u32::MAX);
        loop {
            self.check_running(scope.instance_id, scope.root_id).await?;
            let batch = self
                .repo()
                .find_pending_child_nodes(scope.instance_id, &row.node_id, batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let results = self.run_loop_batch(scope, node, batch, vars).await;

            let children = self
                .repo()
                .find_child_nodes(scope.instance_id, &row.node_id)
                .await?;
            progress = count_progress(&children, LoopPhase::Executing);
            self.checkpoints
                .checkpoint_loop_progress(row.id, &progress)
                .await?;

            let mut batch_failed = false;
            for result in results {
                match result {
                    Err(EngineError::Interrupted(status)) => {
                        return Err(EngineError::Interrupted(status));
                    }
                    Err(_) => batch_failed = true,
                    Ok(_) => {}
                }
            }
            if batch_failed && node.error_handling == LoopErrorPolicy::FailFast {
                break;
            }
        }

        let children = self
            .repo()
            .find_child_nodes(scope.instance_id, &row.node_id)
            .await?;
        let progress = count_progress(&children, LoopPhase::Completed);
        let fail_fast = node.error_handling == LoopErrorPolicy::FailFast;
        if fail_fast && progress.failed_count > 0 {
            self.checkpoints
                .checkpoint_loop_abort(scope.instance_id, row.id, &row.node_id, progress)
                .await?;
        } else {
            self.checkpoints
                .checkpoint_loop_progress(row.id, &progress)
                .await?;
        }

        let output = aggregate(node.join, &children, &progress);
        tracing::debug!(
            instance_id = scope.instance_id,
            node_id = %row.node_id,
            completed = progress.completed_count,
            failed = progress.failed_count,
            "loop finished"
        );

        if progress.failed_count > 0 && node.error_handling != LoopErrorPolicy::Ignore {
            let category = children
                .iter()
                .filter(|c| c.status == NodeStatus::Failed)
                .find_map(|c| c.error_details.as_ref().map(|d| d.category))
                .unwrap_or(ErrorCategory::BusinessLogic);
            return Err(EngineError::NodeFailed {
                node_id: row.node_id.clone(),
                message: format!(
                    "{} of {} iterations failed",
                    progress.failed_count, progress.total_count
                ),
                category,
                output: Some(output),
            });
        }
        Ok(output)
    }

    /// Produce the item list from the loop's data source.
    ///
    /// Accepts an array, an object carrying an `items` array, or `null`
    /// (no iterations).
    async fn loop_items(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        node: &LoopNode,
        input: &Value,
        vars: &Value,
    ) -> Result<Vec<Value>, EngineError> {
        let raw = match &node.data_source {
            DataSource::Executor { executor, config } => {
                let config = self.resolver.resolve_config_variables(config, vars)?;
                self.invoke_executor(scope, row, executor, config, input.clone())
                    .await?
            }
            DataSource::Expression { expression } => self.resolver.evaluate(expression, vars)?,
        };

        match raw {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            Value::Object(mut map) => match map.remove("items") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(EngineError::Validation(format!(
                    "loop '{}' data source returned an object without an 'items' array",
                    row.node_id
                ))),
            },
            other => Err(EngineError::Validation(format!(
                "loop '{}' data source must return an array, got {other}",
                row.node_id
            ))),
        }
    }

    async fn run_loop_batch(
        &self,
        scope: &Scope,
        node: &LoopNode,
        batch: Vec<NodeInstance>,
        vars: &Value,
    ) -> Vec<Result<Value, EngineError>> {
        match node.mode {
            LoopMode::Serial => {
                let mut results = Vec::with_capacity(batch.len());
                for child in batch {
                    if let Err(err) = self.check_running(scope.instance_id, scope.root_id).await {
                        results.push(Err(err));
                        break;
                    }
                    let result = self.run_iteration(scope, node, child, vars).await;
                    let stop = match &result {
                        Ok(_) => false,
                        Err(EngineError::Interrupted(_)) => true,
                        Err(_) => node.error_handling == LoopErrorPolicy::FailFast,
                    };
                    results.push(result);
                    if stop {
                        break;
                    }
                }
                results
            }
            LoopMode::Parallel => {
                let iterations: Vec<BoxFuture<'_, Result<Value, EngineError>>> = batch
                    .into_iter()
                    .map(|child| self.run_iteration(scope, node, child, vars))
                    .collect();
                stream::iter(iterations)
                    .buffer_unordered(node.max_concurrency.max(1))
                    .collect()
                    .await
            }
        }
    }

    /// Run the loop body for one child row. The item and index are visible
    /// to the body's config templates as `item` and `index`.
    fn run_iteration<'a>(
        &'a self,
        scope: &'a Scope,
        node: &'a LoopNode,
        child: NodeInstance,
        vars: &'a Value,
    ) -> BoxFuture<'a, Result<Value, EngineError>> {
        Box::pin(async move {
            let payload = child.input_data.clone().unwrap_or(Value::Null);
            let item = payload["item"].clone();
            let index = payload["index"].clone();

            let mut iteration_vars = vars.clone();
            if let Some(map) = iteration_vars.as_object_mut() {
                map.insert("item".to_string(), item.clone());
                map.insert("index".to_string(), index.clone());
            }
            let input = json!({
                "item": item,
                "index": index,
                "input": vars["input"].clone(),
            });

            let body = NodeDefinition {
                id: child.node_id.clone(),
                name: None,
                depends_on: Vec::new(),
                max_retries: None,
                kind: NodeKind::Task(node.body.clone()),
            };
            self.run_node(scope, child, &body, input, iteration_vars)
                .await
        })
    }
}

fn loop_child(instance_id: i64, parent: &NodeInstance, index: usize, item: Value) -> NewNodeInstance {
    let mut child = NewNodeInstance::new(
        instance_id,
        loop_child_id(&parent.node_id, index),
        format!("{}[{index}]", parent.node_name),
        NodeType::Task,
    );
    child.parent_node_id = Some(parent.node_id.clone());
    child.child_index = u32::try_from(index).ok();
    child.max_retries = parent.max_retries;
    child.input_data = Some(json!({ "item": item, "index": index }));
    child
}

fn count_progress(children: &[NodeInstance], status: LoopPhase) -> LoopProgress {
    let count = |wanted: NodeStatus| {
        let n = children.iter().filter(|c| c.status == wanted).count();
        u32::try_from(n).unwrap_or(u32::MAX)
    };
    LoopProgress {
        status,
        total_count: u32::try_from(children.len()).unwrap_or(u32::MAX),
        completed_count: count(NodeStatus::Completed),
        failed_count: count(NodeStatus::Failed),
    }
}

/// Loop output: `{ results, totalCount, completedCount, failedCount }`.
fn aggregate(join: JoinPolicy, children: &[NodeInstance], progress: &LoopProgress) -> Value {
    let completed = |c: &&NodeInstance| c.status == NodeStatus::Completed;
    let output_of = |c: &NodeInstance| c.output_data.clone().unwrap_or(Value::Null);

    let results = match join {
        JoinPolicy::All => Value::Array(
            children
                .iter()
                .map(|c| {
                    if c.status == NodeStatus::Completed {
                        output_of(c)
                    } else {
                        Value::Null
                    }
                })
                .collect(),
        ),
        JoinPolicy::Any => Value::Array(children.iter().filter(completed).map(output_of).collect()),
        JoinPolicy::First => children
            .iter()
            .find(completed)
            .map(output_of)
            .unwrap_or(Value::Null),
    };

    json!({
        "results": results,
        "totalCount": progress.total_count,
        "completedCount": progress.completed_count,
        "failedCount": progress.failed_count,
    })
}

use conductor_types::definition::ParallelNode;
use conductor_types::error::ErrorCategory;
use conductor_types::node::NodeInstance;
use futures_util::future::{BoxFuture, join_all};
use serde_json::{Map, Value, json};

use crate::repository::workflow::WorkflowRepository;
use crate::workflow::error::EngineError;
use crate::workflow::retry::ErrorClassifier;
use crate::workflow::runtime::Runtime;

use super::{Placement, Scope};

impl<R: WorkflowRepository + 'static> Runtime<R> {
    /// Run every branch concurrently and wait for all of them.
    ///
    /// Output: `{ branches, successCount, failedCount }`. Any failed branch
    /// fails the node, with the aggregate attached as partial output.
    pub(super) async fn execute_parallel(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        node: &ParallelNode,
        vars: &Value,
    ) -> Result<Value, EngineError> {
        let branches: Vec<BoxFuture<'_, Result<Map<String, Value>, EngineError>>> = node
            .branches
            .iter()
            .enumerate()
            .map(|(index, branch)| {
                let fut = self.run_sequence(scope, row, &branch.nodes, Placement::Branch(index), vars.clone());
                Box::pin(fut) as BoxFuture<'_, _>
            })
            .collect();
        let results = join_all(branches).await;

        let mut summaries = Vec::with_capacity(results.len());
        let mut failures: Vec<ErrorCategory> = Vec::new();
        let mut interrupted = None;
        for ((index, branch), result) in node.branches.iter().enumerate().zip(results) {
            let id = branch.id.clone().unwrap_or_else(|| index.to_string());
            match result {
                Ok(outputs) => summaries.push(json!({
                    "index": index,
                    "id": id,
                    "status": "completed",
                    "outputs": outputs,
                })),
                Err(EngineError::Interrupted(status)) => {
                    interrupted.get_or_insert(status);
                }
                Err(err) => {
                    failures.push(ErrorClassifier::classify(&err));
                    summaries.push(json!({
                        "index": index,
                        "id": id,
                        "status": "failed",
                        "error": err.to_string(),
                    }));
                }
            }
        }
        if let Some(status) = interrupted {
            return Err(EngineError::Interrupted(status));
        }

        let failed = failures.len();
        let output = json!({
            "branches": summaries,
            "successCount": node.branches.len() - failed,
            "failedCount": failed,
        });

        if let Some(&category) = failures.first() {
            return Err(EngineError::NodeFailed {
                node_id: row.node_id.clone(),
                message: format!("{failed} of {} branches failed", node.branches.len()),
                category,
                output: Some(output),
            });
        }
        Ok(output)
    }
}

use conductor_types::definition::ConditionNode;
use conductor_types::node::NodeInstance;
use serde_json::{Value, json};

use crate::repository::workflow::WorkflowRepository;
use crate::workflow::error::EngineError;
use crate::workflow::expression::{ExpressionResolver, truthy};
use crate::workflow::runtime::Runtime;

use super::{Placement, Scope};

impl<R: WorkflowRepository + 'static> Runtime<R> {
    /// Evaluate the expression and run the matching branch serially.
    ///
    /// Output: `{ branch, executed, outputs, result }`. An empty branch is
    /// a successful no-op.
    pub(super) async fn execute_condition(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        node: &ConditionNode,
        vars: &Value,
    ) -> Result<Value, EngineError> {
        let result = self.resolver.evaluate(&node.expression, vars)?;
        let branch = truthy(&result);
        let nodes = if branch {
            &node.when_true
        } else {
            &node.when_false
        };
        tracing::debug!(
            instance_id = scope.instance_id,
            node_id = %row.node_id,
            branch,
            "condition evaluated"
        );

        let outputs = self
            .run_sequence(scope, row, nodes, Placement::Condition(branch), vars.clone())
            .await?;

        Ok(json!({
            "branch": branch,
            "executed": !nodes.is_empty(),
            "outputs": outputs,
            "result": result,
        }))
    }
}

use conductor_types::definition::TaskNode;
use conductor_types::node::NodeInstance;
use serde_json::Value;

use crate::concurrency::ResourceClass;
use crate::repository::workflow::WorkflowRepository;
use crate::workflow::error::EngineError;
use crate::workflow::expression::ExpressionResolver;
use crate::workflow::registry::TaskContext;
use crate::workflow::runtime::Runtime;

use super::Scope;

impl<R: WorkflowRepository + 'static> Runtime<R> {
    pub(super) async fn execute_task(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        task: &TaskNode,
        input: &Value,
        vars: &Value,
    ) -> Result<Value, EngineError> {
        let config = self.resolver.resolve_config_variables(&task.config, vars)?;
        self.invoke_executor(scope, row, &task.executor, config, input.clone())
            .await
    }

    /// Call a registered executor while holding a node slot for `row`.
    pub(super) async fn invoke_executor(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        executor_name: &str,
        config: Value,
        input: Value,
    ) -> Result<Value, EngineError> {
        let executor = self.registry.get_executor(executor_name)?;

        self.slots
            .acquire_slot(ResourceClass::Node, row.id, self.config.node_slot_timeout())
            .await?;
        let _slot = self.slots.release_on_drop(ResourceClass::Node, row.id);

        let ctx = TaskContext {
            instance_id: scope.instance_id,
            node_id: row.node_id.clone(),
            node_instance_id: row.id,
            attempt: scope.attempt,
            config,
            input,
        };
        executor
            .execute_boxed(&ctx)
            .await
            .map_err(|source| EngineError::Task {
                executor: executor_name.to_string(),
                source,
            })
    }
}

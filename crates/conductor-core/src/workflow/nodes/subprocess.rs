//! Subprocess nodes: run another definition as a child instance.
//!
//! The child is found again by its deterministic external id
//! (`<parent instance>:<node id>`), so a restarted parent reattaches to
//! the child it already created instead of spawning a second one. The
//! child has no retry budget of its own; the parent's retry policy covers
//! it.

use std::collections::BTreeMap;
use std::sync::Arc;

use conductor_types::definition::{SubprocessNode, WorkflowDefinition};
use conductor_types::error::ErrorCategory;
use conductor_types::event::EngineEvent;
use conductor_types::instance::{NewWorkflowInstance, WorkflowInstance, WorkflowStatus};
use conductor_types::node::{NodeInstance, subprocess_external_id};
use serde_json::{Map, Value, json};

use crate::repository::workflow::WorkflowRepository;
use crate::workflow::definition::materialize_inputs;
use crate::workflow::error::EngineError;
use crate::workflow::expression::ExpressionResolver;
use crate::workflow::retry::RetryPolicy;
use crate::workflow::runtime::Runtime;

use super::Scope;

impl<R: WorkflowRepository + 'static> Runtime<R> {
    pub(super) async fn execute_subprocess(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        node: &SubprocessNode,
        vars: &Value,
    ) -> Result<Value, EngineError> {
        let depth = scope.depth + 1;
        if depth > self.config.max_subprocess_depth {
            return Err(EngineError::Validation(format!(
                "subprocess '{}' exceeds the maximum nesting depth of {}",
                row.node_id, self.config.max_subprocess_depth
            )));
        }

        let external_id = subprocess_external_id(scope.instance_id, &row.node_id);
        let (child, definition) = match self.repo().find_by_external_id(&external_id).await? {
            Some(existing) => {
                let definition = self.load_definition(&existing).await?;
                (existing, definition)
            }
            None => {
                let definition = self
                    .repo()
                    .get_definition(&node.definition_id, node.version.as_deref())
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("workflow definition '{}'", node.definition_id))
                    })?;
                let child = self
                    .create_child(scope, row, node, &definition, external_id, vars)
                    .await?;
                (child, Arc::new(definition))
            }
        };

        let output = match child.status {
            WorkflowStatus::Completed => child.output_data.clone().unwrap_or(Value::Null),
            WorkflowStatus::Cancelled => {
                return Err(EngineError::NodeFailed {
                    node_id: row.node_id.clone(),
                    message: format!("child instance {} was cancelled", child.id),
                    category: ErrorCategory::BusinessLogic,
                    output: None,
                });
            }
            _ => self.run_child(scope, &child, definition, depth).await?,
        };

        if node.output_mapping.is_empty() {
            return Ok(output);
        }
        let child_vars = json!({
            "output": output.clone(),
            "variables": { "input": child.input_data.clone(), "nodes": output },
        });
        self.map_values(&node.output_mapping, &child_vars)
    }

    async fn create_child(
        &self,
        scope: &Scope,
        row: &NodeInstance,
        node: &SubprocessNode,
        definition: &WorkflowDefinition,
        external_id: String,
        vars: &Value,
    ) -> Result<WorkflowInstance, EngineError> {
        let provided = if node.input_mapping.is_empty() {
            vars["input"].clone()
        } else {
            self.map_values(&node.input_mapping, vars)?
        };
        let inputs = materialize_inputs(definition, &provided)?;

        let child = self
            .repo()
            .create_instance(&NewWorkflowInstance {
                definition_id: definition.id.clone(),
                definition_version: definition.version.clone(),
                input_data: inputs,
                external_id: Some(external_id),
                parent_instance_id: Some(scope.instance_id),
                parent_node_id: Some(row.node_id.clone()),
                max_retries: 0,
                priority: definition.config.priority,
                assigned_engine_id: Some(self.engine_id.clone()),
                ..Default::default()
            })
            .await?;
        tracing::info!(
            instance_id = child.id,
            parent_instance_id = scope.instance_id,
            parent_node_id = %row.node_id,
            definition_id = %definition.id,
            "sub-workflow created"
        );
        Ok(child)
    }

    /// Drive a child instance to a terminal status (or an interruption).
    async fn run_child(
        &self,
        scope: &Scope,
        child: &WorkflowInstance,
        definition: Arc<WorkflowDefinition>,
        depth: u32,
    ) -> Result<Value, EngineError> {
        let child_id = child.id;
        let active = if child.status == WorkflowStatus::Running {
            child.clone()
        } else {
            self.transition(child_id, WorkflowStatus::Running, None)
                .await?
        };
        let definition_id = definition.id.clone();
        self.activate(&active, definition, depth).await?;
        self.events.publish(EngineEvent::WorkflowStarted {
            instance_id: child_id,
            definition_id,
        });

        let outcome = match self.drive(child_id, scope.root_id).await {
            Ok(output) => self.complete(child_id, &output).await.map(|()| output),
            Err(EngineError::Interrupted(status)) => Err(EngineError::Interrupted(status)),
            Err(err) => {
                let mut details = RetryPolicy::default()
                    .with_max_retries(0)
                    .error_details(&err, active.retry_count);
                details.escalate = false;
                if let Err(persist) = self
                    .transition(child_id, WorkflowStatus::Failed, Some(&details))
                    .await
                {
                    tracing::warn!(instance_id = child_id, error = %persist, "failed to mark sub-workflow failed");
                }
                self.events.publish(EngineEvent::WorkflowFailed {
                    instance_id: child_id,
                    category: details.category,
                    message: details.message.clone(),
                });
                Err(err)
            }
        };
        self.release_instance(child_id).await;
        outcome
    }

    /// Evaluate `name -> expression` pairs into an object.
    fn map_values(&self, mapping: &BTreeMap<String, String>, vars: &Value) -> Result<Value, EngineError> {
        let mut out = Map::new();
        for (name, expression) in mapping {
            out.insert(name.clone(), self.resolver.evaluate(expression, vars)?);
        }
        Ok(Value::Object(out))
    }
}

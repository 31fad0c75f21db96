//! Workflow definition types.
//!
//! A `WorkflowDefinition` is the immutable, versioned template a workflow
//! instance executes. Nodes are a tagged union over their `type` so each
//! kind carries exactly the fields it needs:
//!
//! ```yaml
//! id: order-sync
//! name: Order Sync
//! version: "1.0.0"
//! nodes:
//!   - id: fetch
//!     type: task
//!     executor: echo
//!   - id: each
//!     type: loop
//!     depends_on: [fetch]
//!     data_source: { type: expression, expression: "nodes.fetch.items" }
//!     body: { executor: echo }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::node::NodeType;

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// Immutable, versioned workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier shared by every version of this workflow.
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs. Required inputs without a default must be supplied
    /// when the workflow is started.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputParameter>,
    /// Top-level nodes in declaration order.
    pub nodes: Vec<NodeDefinition>,
    /// Explicit edges. When present they take precedence over `depends_on`
    /// for ordering.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Look up a top-level node by id.
    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Effective dependencies of a top-level node: its own `depends_on`
    /// plus the sources of any connection targeting it.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        let mut deps: Vec<String> = self
            .node(id)
            .map(|n| n.depends_on.clone())
            .unwrap_or_default();
        for conn in &self.connections {
            if conn.target == id && !deps.contains(&conn.source) {
                deps.push(conn.source.clone());
            }
        }
        deps
    }
}

/// A declared workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParameter {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Directed edge `source -> target` between two top-level nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    pub target: String,
}

/// Workflow-level execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    /// Scheduling priority hint. Higher runs first during recovery.
    #[serde(default)]
    pub priority: i32,
    /// At most one non-terminal instance of this definition may exist.
    #[serde(default)]
    pub singleton: bool,
}

/// Workflow-level retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A node in a workflow graph (or inside a branch of a composite node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique within its enclosing sequence.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl NodeDefinition {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }
}

/// Node kind with its kind-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Task(TaskNode),
    Loop(LoopNode),
    Parallel(ParallelNode),
    Condition(ConditionNode),
    Subprocess(SubprocessNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Task(_) => NodeType::Task,
            NodeKind::Loop(_) => NodeType::Loop,
            NodeKind::Parallel(_) => NodeType::Parallel,
            NodeKind::Condition(_) => NodeType::Condition,
            NodeKind::Subprocess(_) => NodeType::Subprocess,
        }
    }
}

/// Invoke a named executor from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub executor: String,
    /// Executor configuration. String values may contain `${...}` templates.
    #[serde(default)]
    pub config: Value,
}

/// Iterate a body task over an array produced by a data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNode {
    pub data_source: DataSource,
    pub body: TaskNode,
    #[serde(default)]
    pub mode: LoopMode,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub error_handling: LoopErrorPolicy,
    #[serde(default)]
    pub join: JoinPolicy,
    /// Maximum number of pending children fetched per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_batch_size() -> usize {
    100
}

/// Where a loop obtains its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSource {
    /// Run an executor; it must return an array (or an object with `items`).
    Executor {
        executor: String,
        #[serde(default)]
        config: Value,
    },
    /// Evaluate an expression against the workflow variables.
    Expression { expression: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopErrorPolicy {
    /// Abort remaining iterations on the first failure.
    #[default]
    FailFast,
    /// Run every iteration; fail the loop afterwards if any failed.
    Continue,
    /// Run every iteration; the loop completes regardless of failures.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Every result in index order, `null` for failed iterations.
    #[default]
    All,
    /// Successful results only.
    Any,
    /// First successful result by index.
    First,
}

/// Run a fixed set of branches concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelNode {
    pub branches: Vec<ParallelBranch>,
}

/// One branch of a parallel node: a serial sequence of nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub nodes: Vec<NodeDefinition>,
}

/// Execute one of two node sequences depending on an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNode {
    pub expression: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when_true: Vec<NodeDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub when_false: Vec<NodeDefinition>,
}

/// Run another workflow definition as a child instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessNode {
    pub definition_id: String,
    /// Pin a version. `None` resolves the latest stored version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Child input name -> expression over the parent variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Parent output name -> expression over `{ output, variables }` of the child.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SAMPLE_YAML: &str = r#"
id: order-sync
name: Order Sync
inputs:
  - name: region
    required: true
  - name: limit
    default: 10
nodes:
  - id: fetch
    type: task
    executor: items
    config:
      items: [1, 2, 3]
  - id: each
    type: loop
    depends_on: [fetch]
    data_source:
      type: expression
      expression: nodes.fetch.items
    body:
      executor: echo
    mode: parallel
    max_concurrency: 2
  - id: route
    type: condition
    depends_on: [each]
    expression: "input.region == 'eu'"
    when_true:
      - id: notify
        type: task
        executor: echo
  - id: fanout
    type: parallel
    branches:
      - nodes:
          - id: a
            type: task
            executor: echo
      - nodes:
          - id: b
            type: task
            executor: echo
  - id: child
    type: subprocess
    definition_id: billing
    input_mapping:
      region: input.region
"#;

    #[test]
    fn parse_yaml_definition_with_every_node_kind() {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(def.id, "order-sync");
        assert_eq!(def.version, "1.0.0");
        assert_eq!(def.nodes.len(), 5);

        let kinds: Vec<NodeType> = def.nodes.iter().map(|n| n.node_type()).collect();
        assert_eq!(
            kinds,
            vec![
                NodeType::Task,
                NodeType::Loop,
                NodeType::Condition,
                NodeType::Parallel,
                NodeType::Subprocess
            ]
        );

        match &def.nodes[1].kind {
            NodeKind::Loop(l) => {
                assert_eq!(l.mode, LoopMode::Parallel);
                assert_eq!(l.max_concurrency, 2);
                assert_eq!(l.error_handling, LoopErrorPolicy::FailFast);
                assert_eq!(l.join, JoinPolicy::All);
                assert_eq!(l.batch_size, 100);
                assert!(matches!(l.data_source, DataSource::Expression { .. }));
            }
            other => panic!("expected loop, got {other:?}"),
        }

        assert_eq!(def.inputs[1].default, Some(json!(10)));
        assert_eq!(def.config.retry.max_retries, 3);
        assert!(!def.config.singleton);
    }

    #[test]
    fn dependencies_merge_depends_on_and_connections() {
        let mut def: WorkflowDefinition = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        def.connections.push(Connection {
            source: "fanout".to_string(),
            target: "route".to_string(),
        });
        let deps = def.dependencies_of("route");
        assert_eq!(deps, vec!["each".to_string(), "fanout".to_string()]);
    }

    #[test]
    fn task_node_round_trips_through_json() {
        let node = NodeDefinition {
            id: "fetch".to_string(),
            name: None,
            depends_on: vec![],
            max_retries: Some(1),
            kind: NodeKind::Task(TaskNode {
                executor: "echo".to_string(),
                config: json!({"message": "${input.name}"}),
            }),
        };
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["type"], "task");
        assert_eq!(value["executor"], "echo");
        let back: NodeDefinition = serde_json::from_value(value).unwrap();
        assert_eq!(back, node);
    }
}

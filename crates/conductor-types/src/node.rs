//! Node instance types: the persisted execution unit for one definition
//! node or one dynamically spawned child.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorDetails;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
            NodeStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(NodeStatus::Pending),
            "running" => Ok(NodeStatus::Running),
            "completed" => Ok(NodeStatus::Completed),
            "failed" => Ok(NodeStatus::Failed),
            "skipped" => Ok(NodeStatus::Skipped),
            "cancelled" => Ok(NodeStatus::Cancelled),
            other => Err(format!("invalid node status: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Task,
    Loop,
    Parallel,
    Condition,
    Subprocess,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Task => "task",
            NodeType::Loop => "loop",
            NodeType::Parallel => "parallel",
            NodeType::Condition => "condition",
            NodeType::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "task" => Ok(NodeType::Task),
            "loop" => Ok(NodeType::Loop),
            "parallel" => Ok(NodeType::Parallel),
            "condition" => Ok(NodeType::Condition),
            "subprocess" => Ok(NodeType::Subprocess),
            other => Err(format!("invalid node type: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Loop progress
// ---------------------------------------------------------------------------

/// Phase of a loop node's two-phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    #[default]
    Creating,
    Executing,
    Completed,
}

/// Sub-state of a loop node, updated atomically with child creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoopProgress {
    pub status: LoopPhase,
    pub total_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
}

impl LoopProgress {
    pub fn executing(total_count: u32) -> Self {
        Self {
            status: LoopPhase::Executing,
            total_count,
            completed_count: 0,
            failed_count: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Deterministic child ids
// ---------------------------------------------------------------------------

/// Node id of the `index`-th loop iteration under `parent`.
pub fn loop_child_id(parent: &str, index: usize) -> String {
    format!("{parent}[{index}]")
}

/// Node id of a node inside branch `branch` of parallel node `parent`.
pub fn parallel_child_id(parent: &str, branch: usize, node_id: &str) -> String {
    format!("{parent}/{branch}/{node_id}")
}

/// Node id of a node inside the chosen branch of condition node `parent`.
pub fn condition_child_id(parent: &str, branch: bool, node_id: &str) -> String {
    format!("{parent}/{branch}/{node_id}")
}

/// External id of the child instance spawned by a subprocess node.
pub fn subprocess_external_id(parent_instance_id: i64, parent_node_id: &str) -> String {
    format!("{parent_instance_id}:{parent_node_id}")
}

// ---------------------------------------------------------------------------
// NodeInstance
// ---------------------------------------------------------------------------

/// Persisted execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: i64,
    pub workflow_instance_id: i64,
    /// Deterministic id, stable across retries and recovery.
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub parent_node_id: Option<String>,
    pub child_index: Option<u32>,
    pub parallel_index: Option<u32>,
    pub parallel_group_id: Option<String>,
    pub depends_on: Vec<String>,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub loop_progress: Option<LoopProgress>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating a node row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNodeInstance {
    pub workflow_instance_id: i64,
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub parent_node_id: Option<String>,
    pub child_index: Option<u32>,
    pub parallel_index: Option<u32>,
    pub parallel_group_id: Option<String>,
    pub depends_on: Vec<String>,
    pub input_data: Option<Value>,
    pub max_retries: u32,
    pub loop_progress: Option<LoopProgress>,
}

impl NewNodeInstance {
    /// A pending top-level node row.
    pub fn new(
        workflow_instance_id: i64,
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        node_type: NodeType,
    ) -> Self {
        Self {
            workflow_instance_id,
            node_id: node_id.into(),
            node_name: node_name.into(),
            node_type,
            parent_node_id: None,
            child_index: None,
            parallel_index: None,
            parallel_group_id: None,
            depends_on: Vec::new(),
            input_data: None,
            max_retries: 0,
            loop_progress: None,
        }
    }
}

/// Status transition plus whichever fields the transition records.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub status: NodeStatus,
    pub input_data: Option<Value>,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub error_details: Option<ErrorDetails>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub retry_count: Option<u32>,
}

impl NodeUpdate {
    pub fn new(status: NodeStatus) -> Self {
        Self {
            status,
            input_data: None,
            output_data: None,
            error_message: None,
            error_details: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            retry_count: None,
        }
    }

    /// `running`, stamping `started_at` and recording the input.
    pub fn running(input: Value, retry_count: u32) -> Self {
        Self {
            input_data: Some(input),
            started_at: Some(Utc::now()),
            retry_count: Some(retry_count),
            ..Self::new(NodeStatus::Running)
        }
    }

    /// `completed` with output and duration.
    pub fn completed(output: Value, duration_ms: i64) -> Self {
        Self {
            output_data: Some(output),
            completed_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
            ..Self::new(NodeStatus::Completed)
        }
    }

    /// `failed` with error message/details and optional partial output.
    pub fn failed(details: ErrorDetails, output: Option<Value>, duration_ms: i64) -> Self {
        Self {
            output_data: output,
            error_message: Some(details.message.clone()),
            error_details: Some(details),
            completed_at: Some(Utc::now()),
            duration_ms: Some(duration_ms),
            ..Self::new(NodeStatus::Failed)
        }
    }
}

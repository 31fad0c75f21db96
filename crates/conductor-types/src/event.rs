//! Engine lifecycle events published on the event bus.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;
use crate::node::NodeType;

/// Events emitted while workflows execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    WorkflowStarted {
        instance_id: i64,
        definition_id: String,
    },
    WorkflowCompleted {
        instance_id: i64,
    },
    WorkflowFailed {
        instance_id: i64,
        category: ErrorCategory,
        message: String,
    },
    WorkflowPaused {
        instance_id: i64,
    },
    WorkflowCancelled {
        instance_id: i64,
    },
    NodeStarted {
        instance_id: i64,
        node_id: String,
        node_type: NodeType,
    },
    NodeCompleted {
        instance_id: i64,
        node_id: String,
        duration_ms: i64,
    },
    NodeFailed {
        instance_id: i64,
        node_id: String,
        message: String,
    },
    RetryScheduled {
        instance_id: i64,
        retry_count: u32,
        delay_ms: u64,
    },
    /// A failure that needs operator attention.
    Escalated {
        instance_id: i64,
        category: ErrorCategory,
        message: String,
    },
}

impl EngineEvent {
    pub fn instance_id(&self) -> i64 {
        match self {
            EngineEvent::WorkflowStarted { instance_id, .. }
            | EngineEvent::WorkflowCompleted { instance_id }
            | EngineEvent::WorkflowFailed { instance_id, .. }
            | EngineEvent::WorkflowPaused { instance_id }
            | EngineEvent::WorkflowCancelled { instance_id }
            | EngineEvent::NodeStarted { instance_id, .. }
            | EngineEvent::NodeCompleted { instance_id, .. }
            | EngineEvent::NodeFailed { instance_id, .. }
            | EngineEvent::RetryScheduled { instance_id, .. }
            | EngineEvent::Escalated { instance_id, .. } => *instance_id,
        }
    }
}

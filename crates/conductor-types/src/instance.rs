//! Workflow instance types and the instance status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorDetails;

// ---------------------------------------------------------------------------
// WorkflowStatus
// ---------------------------------------------------------------------------

/// Status of a workflow instance.
///
/// ```text
/// pending -> running -> completed | failed | cancelled
/// running <-> paused
/// failed  -> running            (retry)
/// pending | running | paused -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Statuses that end an execution attempt.
    pub const TERMINAL: [WorkflowStatus; 3] = [
        WorkflowStatus::Completed,
        WorkflowStatus::Failed,
        WorkflowStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Statuses at which an engine may shut down without losing work.
    pub fn is_safe_point(self) -> bool {
        self.is_terminal() || self == WorkflowStatus::Paused
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Failed, Running)
                | (Pending, Cancelled)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                // Admission failures before the first node runs.
                | (Pending, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(format!("invalid workflow status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowInstance
// ---------------------------------------------------------------------------

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub definition_id: String,
    pub definition_version: String,
    pub status: WorkflowStatus,
    pub input_data: Value,
    pub output_data: Option<Value>,
    /// Free-form variable bag, persisted at every checkpoint.
    pub context_data: Value,
    pub business_key: Option<String>,
    pub mutex_key: Option<String>,
    /// Deterministic id used to find sub-workflow children again after a crash.
    pub external_id: Option<String>,
    pub parent_instance_id: Option<i64>,
    pub parent_node_id: Option<String>,
    /// Checkpoint: the last node that completed.
    pub current_node_id: Option<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub lock_owner: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: i32,
    pub assigned_engine_id: Option<String>,
    pub error_details: Option<ErrorDetails>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Whether this instance has resumed from a checkpoint at least once.
    pub fn has_checkpoint(&self) -> bool {
        self.current_node_id.is_some()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether this instance still owns its business and mutex keys: it is
    /// not terminal, or it failed with an automatic retry still to come.
    pub fn holds_keys(&self) -> bool {
        match self.status {
            WorkflowStatus::Failed => self
                .error_details
                .as_ref()
                .is_some_and(|d| d.retryable && d.retry_count < self.max_retries),
            status => !status.is_terminal(),
        }
    }
}

/// Fields supplied when persisting a new instance. Storage assigns the id
/// and timestamps.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewWorkflowInstance {
    pub definition_id: String,
    pub definition_version: String,
    pub input_data: Value,
    pub business_key: Option<String>,
    pub mutex_key: Option<String>,
    pub external_id: Option<String>,
    pub parent_instance_id: Option<i64>,
    pub parent_node_id: Option<String>,
    pub max_retries: u32,
    pub priority: i32,
    pub assigned_engine_id: Option<String>,
}

/// Checkpoint state persisted after each completed node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Checkpoint {
    pub current_node_id: Option<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub context_data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Failed.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
    }

    #[test]
    fn test_illegal_transitions() {
        use WorkflowStatus::*;
        assert!(!Completed.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn test_safe_points() {
        assert!(WorkflowStatus::Paused.is_safe_point());
        assert!(WorkflowStatus::Failed.is_safe_point());
        assert!(!WorkflowStatus::Running.is_safe_point());
        assert!(!WorkflowStatus::Pending.is_safe_point());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<WorkflowStatus>().unwrap(), status);
            let json = serde_json::to_value(status).unwrap();
            assert_eq!(json.as_str(), Some(status.as_str()));
        }
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }

    fn instance(status: WorkflowStatus, details: Option<ErrorDetails>) -> WorkflowInstance {
        let now = Utc::now();
        WorkflowInstance {
            id: 1,
            definition_id: "order".to_string(),
            definition_version: "1.0.0".to_string(),
            status,
            input_data: Value::Null,
            output_data: None,
            context_data: Value::Null,
            business_key: Some("order-1".to_string()),
            mutex_key: None,
            external_id: None,
            parent_instance_id: None,
            parent_node_id: None,
            current_node_id: None,
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            lock_owner: None,
            lock_acquired_at: None,
            last_heartbeat: None,
            retry_count: 1,
            max_retries: 3,
            priority: 0,
            assigned_engine_id: None,
            error_details: details,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_failed_instance_keeps_keys_while_retry_pending() {
        use crate::error::ErrorCategory;

        let mut transient = ErrorDetails::new(ErrorCategory::Connection, "reset");
        transient.retry_count = 2;
        assert!(instance(WorkflowStatus::Failed, Some(transient.clone())).holds_keys());

        transient.retry_count = 3;
        assert!(!instance(WorkflowStatus::Failed, Some(transient)).holds_keys());

        let fatal = ErrorDetails::new(ErrorCategory::Validation, "bad input");
        assert!(!instance(WorkflowStatus::Failed, Some(fatal)).holds_keys());
        assert!(!instance(WorkflowStatus::Failed, None).holds_keys());

        assert!(instance(WorkflowStatus::Paused, None).holds_keys());
        assert!(!instance(WorkflowStatus::Completed, None).holds_keys());
        assert!(!instance(WorkflowStatus::Cancelled, None).holds_keys());
    }
}

//! Repository errors and the workflow error taxonomy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in conductor-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classification of a workflow failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Connection,
    Timeout,
    Transaction,
    Validation,
    Permission,
    Configuration,
    BusinessLogic,
}

impl ErrorCategory {
    /// Transient categories are retried by the engine.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::Transaction
        )
    }

    pub fn severity(self) -> ErrorSeverity {
        match self {
            ErrorCategory::Validation => ErrorSeverity::Low,
            ErrorCategory::Connection
            | ErrorCategory::Timeout
            | ErrorCategory::Transaction
            | ErrorCategory::BusinessLogic => ErrorSeverity::Medium,
            ErrorCategory::Permission => ErrorSeverity::High,
            ErrorCategory::Configuration => ErrorSeverity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Connection => "connection",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Transaction => "transaction",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::BusinessLogic => "business_logic",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Multiplier applied to the retry backoff.
    pub fn backoff_factor(self) -> u64 {
        match self {
            ErrorSeverity::Low | ErrorSeverity::Medium => 1,
            ErrorSeverity::High => 2,
            ErrorSeverity::Critical => 4,
        }
    }
}

/// Structured failure record persisted on instance and node rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    pub retryable: bool,
    /// Operator attention required.
    #[serde(default)]
    pub escalate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorDetails {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            severity: category.severity(),
            message: message.into(),
            retryable: category.is_retryable(),
            escalate: false,
            node_id: None,
            retry_count: 0,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

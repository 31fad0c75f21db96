//! Error classification and retry policy.
//!
//! Stateless: [`ErrorClassifier`] maps an [`EngineError`] onto the persisted
//! error taxonomy, and [`RetryPolicy`] turns a category plus retry count into
//! a retry decision, a backoff delay, and an escalation flag.

use std::time::Duration;

use conductor_types::definition::RetryConfig;
use conductor_types::error::{ErrorCategory, ErrorDetails, ErrorSeverity, RepositoryError};

use super::error::EngineError;

// ---------------------------------------------------------------------------
// ErrorClassifier
// ---------------------------------------------------------------------------

/// Maps raw failures onto [`ErrorCategory`].
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Classify an engine error.
    ///
    /// Executor failures use the category the executor attached, if any;
    /// otherwise the message is inspected.
    pub fn classify(err: &EngineError) -> ErrorCategory {
        match err {
            EngineError::Validation(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::BusinessKeyConflict { .. }
            | EngineError::MutexKeyConflict { .. }
            | EngineError::InstanceLocked { .. }
            | EngineError::Expression(_) => ErrorCategory::Validation,
            EngineError::Connection(_)
            | EngineError::Lock(_)
            | EngineError::Scheduler(_)
            | EngineError::ShuttingDown
            | EngineError::Interrupted(_) => ErrorCategory::Connection,
            EngineError::Timeout(_) | EngineError::ResourceExhausted(_) => ErrorCategory::Timeout,
            EngineError::Transaction(_) | EngineError::LockNotAcquired(_) => {
                ErrorCategory::Transaction
            }
            EngineError::Permission(_) => ErrorCategory::Permission,
            EngineError::Configuration(_)
            | EngineError::CircularDependency(_)
            | EngineError::ExecutorNotFound(_)
            | EngineError::NotFound(_) => ErrorCategory::Configuration,
            EngineError::Task { source, .. } => source
                .category
                .unwrap_or_else(|| Self::classify_message(&source.message)),
            EngineError::NodeFailed { category, .. } => *category,
            EngineError::Repository(repo) => match repo {
                RepositoryError::Connection => ErrorCategory::Connection,
                RepositoryError::Conflict(_) => ErrorCategory::Transaction,
                RepositoryError::NotFound => ErrorCategory::BusinessLogic,
                RepositoryError::Query(msg) => match Self::classify_message(msg) {
                    ErrorCategory::BusinessLogic => ErrorCategory::Transaction,
                    other => other,
                },
            },
        }
    }

    /// Keyword-based classification of a free-form failure message.
    pub fn classify_message(message: &str) -> ErrorCategory {
        let msg = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

        if has(&["timeout", "timed out", "deadline exceeded"]) {
            ErrorCategory::Timeout
        } else if has(&["deadlock", "transaction", "serializ", "database is locked"]) {
            ErrorCategory::Transaction
        } else if has(&["connection", "refused", "reset by peer", "unreachable", "network"]) {
            ErrorCategory::Connection
        } else if has(&["permission", "forbidden", "denied", "unauthorized"]) {
            ErrorCategory::Permission
        } else if has(&["config", "not configured"]) {
            ErrorCategory::Configuration
        } else if has(&["invalid", "validation", "required", "malformed"]) {
            ErrorCategory::Validation
        } else {
            ErrorCategory::BusinessLogic
        }
    }

    /// Node id the failure originated from, if it crossed a node boundary.
    pub fn failed_node(err: &EngineError) -> Option<&str> {
        match err {
            EngineError::NodeFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff scaled by severity, without jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Same policy with a different retry budget (the per-instance value).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether a failure of `category` after `retry_count` retries is retried.
    pub fn should_retry(&self, category: ErrorCategory, retry_count: u32) -> bool {
        category.is_retryable() && retry_count < self.max_retries
    }

    /// `min(base * 2^retry_count * severity_factor, max)`.
    pub fn backoff(&self, retry_count: u32, severity: ErrorSeverity) -> Duration {
        let base = self.base_delay.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let ms = base
            .saturating_mul(exp)
            .saturating_mul(severity.backoff_factor());
        Duration::from_millis(ms).min(self.max_delay)
    }

    /// Non-retryable failures of high severity, and retryable failures that
    /// ran out of retries, need operator attention.
    pub fn should_escalate(&self, category: ErrorCategory, retry_count: u32) -> bool {
        if category.is_retryable() {
            retry_count >= self.max_retries
        } else {
            category.severity() >= ErrorSeverity::High
        }
    }

    /// Build the persisted error record for `err`.
    pub fn error_details(&self, err: &EngineError, retry_count: u32) -> ErrorDetails {
        let category = ErrorClassifier::classify(err);
        let mut details = ErrorDetails::new(category, err.to_string());
        details.retry_count = retry_count;
        details.escalate = self.should_escalate(category, retry_count);
        if let Some(node_id) = ErrorClassifier::failed_node(err) {
            details = details.with_node(node_id);
        }
        details
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::registry::TaskError;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5_000),
        }
    }

    #[test]
    fn classify_messages() {
        assert_eq!(
            ErrorClassifier::classify_message("request timed out after 5s"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            ErrorClassifier::classify_message("Connection refused (os error 111)"),
            ErrorCategory::Connection
        );
        assert_eq!(
            ErrorClassifier::classify_message("deadlock detected"),
            ErrorCategory::Transaction
        );
        assert_eq!(
            ErrorClassifier::classify_message("403 Forbidden"),
            ErrorCategory::Permission
        );
        assert_eq!(
            ErrorClassifier::classify_message("field 'email' is required"),
            ErrorCategory::Validation
        );
        assert_eq!(
            ErrorClassifier::classify_message("insufficient funds"),
            ErrorCategory::BusinessLogic
        );
    }

    #[test]
    fn executor_category_hint_wins() {
        let err = EngineError::Task {
            executor: "http".to_string(),
            source: TaskError::with_category(ErrorCategory::Permission, "timed out"),
        };
        assert_eq!(ErrorClassifier::classify(&err), ErrorCategory::Permission);

        let err = EngineError::Task {
            executor: "http".to_string(),
            source: TaskError::new("timed out"),
        };
        assert_eq!(ErrorClassifier::classify(&err), ErrorCategory::Timeout);
    }

    #[test]
    fn structural_errors_are_configuration() {
        assert_eq!(
            ErrorClassifier::classify(&EngineError::CircularDependency("a".into())),
            ErrorCategory::Configuration
        );
        assert_eq!(
            ErrorClassifier::classify(&EngineError::ExecutorNotFound("x".into())),
            ErrorCategory::Configuration
        );
    }

    #[test]
    fn repository_errors_are_transient() {
        let err = EngineError::Repository(RepositoryError::Query("disk I/O error".into()));
        assert_eq!(ErrorClassifier::classify(&err), ErrorCategory::Transaction);
        let err = EngineError::Repository(RepositoryError::Connection);
        assert_eq!(ErrorClassifier::classify(&err), ErrorCategory::Connection);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(0, ErrorSeverity::Medium), Duration::from_millis(100));
        assert_eq!(p.backoff(1, ErrorSeverity::Medium), Duration::from_millis(200));
        assert_eq!(p.backoff(3, ErrorSeverity::Medium), Duration::from_millis(800));
        assert_eq!(p.backoff(1, ErrorSeverity::Critical), Duration::from_millis(800));
        assert_eq!(p.backoff(10, ErrorSeverity::Medium), Duration::from_millis(5_000));
        assert_eq!(p.backoff(200, ErrorSeverity::Critical), Duration::from_millis(5_000));
    }

    #[test]
    fn retry_only_transient_within_budget() {
        let p = policy(2);
        assert!(p.should_retry(ErrorCategory::Connection, 0));
        assert!(p.should_retry(ErrorCategory::Timeout, 1));
        assert!(!p.should_retry(ErrorCategory::Timeout, 2));
        assert!(!p.should_retry(ErrorCategory::Validation, 0));
    }

    #[test]
    fn escalation_rules() {
        let p = policy(2);
        assert!(!p.should_escalate(ErrorCategory::Connection, 1));
        assert!(p.should_escalate(ErrorCategory::Connection, 2));
        assert!(!p.should_escalate(ErrorCategory::Validation, 0));
        assert!(!p.should_escalate(ErrorCategory::BusinessLogic, 0));
        assert!(p.should_escalate(ErrorCategory::Permission, 0));
        assert!(p.should_escalate(ErrorCategory::Configuration, 0));
    }

    #[test]
    fn error_details_carry_node_and_escalation() {
        let err = EngineError::NodeFailed {
            node_id: "charge".to_string(),
            message: "connection reset".to_string(),
            category: ErrorCategory::Connection,
            output: None,
        };
        let details = policy(2).error_details(&err, 2);
        assert_eq!(details.category, ErrorCategory::Connection);
        assert_eq!(details.node_id.as_deref(), Some("charge"));
        assert!(details.retryable);
        assert!(details.escalate);
        assert_eq!(details.retry_count, 2);
    }
}

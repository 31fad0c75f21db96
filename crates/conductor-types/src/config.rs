//! Engine configuration types.
//!
//! `EngineConfig` represents `conductor.toml`. Every field has a default so
//! a partial (or missing) file yields a fully-populated config. Call
//! [`EngineConfig::validated`] once after loading to normalize values that
//! depend on each other.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for one engine process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine instance id. Generated at startup when absent.
    #[serde(default)]
    pub engine_id: Option<String>,

    /// Hostname reported to the scheduler. Defaults to `$HOSTNAME`.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Workflow slots per process.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,

    /// Node (task execution) slots per process.
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,

    /// How long a task waits for a node slot before failing.
    #[serde(default = "default_node_slot_timeout_ms")]
    pub node_slot_timeout_ms: u64,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Terminal contexts idle longer than this are evicted by the sweep.
    #[serde(default = "default_context_idle_timeout_ms")]
    pub context_idle_timeout_ms: u64,

    /// Upper bound on waiting for in-flight workflows during shutdown.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default = "default_dependency_poll_interval_ms")]
    pub dependency_poll_interval_ms: u64,

    #[serde(default = "default_dependency_wait_timeout_ms")]
    pub dependency_wait_timeout_ms: u64,

    /// Maximum interrupted instances examined per recovery pass.
    #[serde(default = "default_recovery_batch_limit")]
    pub recovery_batch_limit: u32,

    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,

    /// Engines whose heartbeat is older than this are not assigned work.
    #[serde(default = "default_scheduler_stale_after_ms")]
    pub scheduler_stale_after_ms: u64,

    #[serde(default = "default_max_subprocess_depth")]
    pub max_subprocess_depth: u32,

    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Distributed lock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Lease duration.
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    /// Auto-renewal interval. Must be shorter than `ttl_ms`.
    #[serde(default = "default_lock_renewal_interval_ms")]
    pub renewal_interval_ms: u64,

    /// Fail `start_workflow` when the instance lock cannot be acquired
    /// instead of logging a warning and proceeding.
    #[serde(default)]
    pub require_acquisition: bool,
}

fn default_max_concurrent_workflows() -> usize {
    32
}

fn default_max_concurrent_nodes() -> usize {
    64
}

fn default_node_slot_timeout_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

fn default_context_idle_timeout_ms() -> u64 {
    300_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_dependency_poll_interval_ms() -> u64 {
    250
}

fn default_dependency_wait_timeout_ms() -> u64 {
    60_000
}

fn default_recovery_batch_limit() -> u32 {
    50
}

fn default_recovery_interval_ms() -> u64 {
    30_000
}

fn default_scheduler_stale_after_ms() -> u64 {
    30_000
}

fn default_max_subprocess_depth() -> u32 {
    8
}

fn default_event_capacity() -> usize {
    1024
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_lock_renewal_interval_ms() -> u64 {
    10_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            renewal_interval_ms: default_lock_renewal_interval_ms(),
            require_acquisition: false,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: None,
            hostname: None,
            max_concurrent_workflows: default_max_concurrent_workflows(),
            max_concurrent_nodes: default_max_concurrent_nodes(),
            node_slot_timeout_ms: default_node_slot_timeout_ms(),
            lock: LockConfig::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            context_idle_timeout_ms: default_context_idle_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            dependency_poll_interval_ms: default_dependency_poll_interval_ms(),
            dependency_wait_timeout_ms: default_dependency_wait_timeout_ms(),
            recovery_batch_limit: default_recovery_batch_limit(),
            recovery_interval_ms: default_recovery_interval_ms(),
            scheduler_stale_after_ms: default_scheduler_stale_after_ms(),
            max_subprocess_depth: default_max_subprocess_depth(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    /// Normalize interdependent values.
    ///
    /// - Slot pools and the event channel hold at least one entry.
    /// - The lock renewal interval is kept strictly below the lease TTL
    ///   (a third of the TTL when misconfigured).
    pub fn validated(mut self) -> Self {
        self.max_concurrent_workflows = self.max_concurrent_workflows.max(1);
        self.max_concurrent_nodes = self.max_concurrent_nodes.max(1);
        self.event_capacity = self.event_capacity.max(1);
        self.lock.ttl_ms = self.lock.ttl_ms.max(3);
        if self.lock.renewal_interval_ms == 0 || self.lock.renewal_interval_ms >= self.lock.ttl_ms {
            self.lock.renewal_interval_ms = self.lock.ttl_ms / 3;
        }
        self.heartbeat_interval_ms = self.heartbeat_interval_ms.max(1);
        self.sweep_interval_ms = self.sweep_interval_ms.max(1);
        self.dependency_poll_interval_ms = self.dependency_poll_interval_ms.max(1);
        self
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock.ttl_ms)
    }

    pub fn lock_renewal_interval(&self) -> Duration {
        Duration::from_millis(self.lock.renewal_interval_ms)
    }

    pub fn node_slot_timeout(&self) -> Duration {
        Duration::from_millis(self.node_slot_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn context_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.context_idle_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn dependency_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dependency_poll_interval_ms)
    }

    pub fn dependency_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_wait_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn scheduler_stale_after(&self) -> Duration {
        Duration::from_millis(self.scheduler_stale_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_workflows, 32);
        assert_eq!(config.lock.ttl_ms, 30_000);
        assert!(config.lock.renewal_interval_ms < config.lock.ttl_ms);
        assert!(!config.lock.require_acquisition);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
max_concurrent_workflows = 4

[lock]
ttl_ms = 9000
"#,
        )
        .unwrap();
        assert_eq!(config.max_concurrent_workflows, 4);
        assert_eq!(config.max_concurrent_nodes, 64);
        assert_eq!(config.lock.ttl_ms, 9000);
        assert_eq!(config.lock.renewal_interval_ms, 10_000);
    }

    #[test]
    fn test_validated_clamps_renewal_below_ttl() {
        let mut config = EngineConfig::default();
        config.lock.ttl_ms = 9_000;
        config.lock.renewal_interval_ms = 10_000;
        config.max_concurrent_workflows = 0;
        let config = config.validated();
        assert_eq!(config.lock.renewal_interval_ms, 3_000);
        assert_eq!(config.max_concurrent_workflows, 1);
        assert_eq!(config.lock_renewal_interval(), Duration::from_millis(3_000));
    }
}

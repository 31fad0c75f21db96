//! Engine instance registration records held by the distributed scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Load snapshot reported with every heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineLoad {
    pub active_workflows: u32,
    pub active_nodes: u32,
    /// Fraction of workflow slots in use, 0.0..=1.0.
    pub cpu_estimate: f64,
    pub memory_estimate_mb: f64,
}

/// One running engine process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub instance_id: String,
    pub hostname: String,
    pub load: EngineLoad,
    pub supported_executors: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl EngineInfo {
    /// Whether this engine can run every executor in `capabilities`.
    pub fn supports(&self, capabilities: &[String]) -> bool {
        capabilities
            .iter()
            .all(|c| self.supported_executors.iter().any(|s| s == c))
    }
}

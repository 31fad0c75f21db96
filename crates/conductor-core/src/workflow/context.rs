//! Process-local execution contexts.
//!
//! One `ExecutionContext` per workflow instance this engine is driving:
//! the definition, the workflow inputs, completed node outputs, and the
//! free-form variable bag. Contexts are never shared across processes; the
//! persisted `context_data` column is the durable copy and is used to
//! rebuild a context on resume.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use conductor_types::definition::WorkflowDefinition;
use conductor_types::instance::{Checkpoint, WorkflowInstance, WorkflowStatus};
use dashmap::DashMap;
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// In-memory state of one running workflow instance.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub instance_id: i64,
    pub definition: Arc<WorkflowDefinition>,
    pub status: WorkflowStatus,
    /// Subprocess nesting depth; 0 for top-level instances.
    pub depth: u32,
    inputs: Value,
    outputs: Map<String, Value>,
    vars: Map<String, Value>,
    completed_nodes: Vec<String>,
    failed_nodes: Vec<String>,
    current_node_id: Option<String>,
    last_access: Instant,
}

impl ExecutionContext {
    /// Build a context from a persisted instance, restoring any checkpoint.
    pub fn restore(instance: &WorkflowInstance, definition: Arc<WorkflowDefinition>, depth: u32) -> Self {
        let object = |key: &str| -> Map<String, Value> {
            instance
                .context_data
                .get(key)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };
        Self {
            instance_id: instance.id,
            definition,
            status: instance.status,
            depth,
            inputs: instance.input_data.clone(),
            outputs: object("nodes"),
            vars: object("vars"),
            completed_nodes: instance.completed_nodes.clone(),
            failed_nodes: instance.failed_nodes.clone(),
            current_node_id: instance.current_node_id.clone(),
            last_access: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_access.elapsed()
    }

    pub fn inputs(&self) -> &Value {
        &self.inputs
    }

    pub fn output(&self, node_id: &str) -> Option<&Value> {
        self.outputs.get(node_id)
    }

    /// Map of node id -> output for every completed top-level node.
    pub fn outputs(&self) -> Value {
        Value::Object(self.outputs.clone())
    }

    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
        self.touch();
    }

    /// Expression variables:
    /// `{ input, nodes, vars, instance: { id, definition_id, version } }`.
    pub fn variables(&self) -> Value {
        json!({
            "input": self.inputs,
            "nodes": self.outputs,
            "vars": self.vars,
            "instance": {
                "id": self.instance_id,
                "definition_id": self.definition.id,
                "version": self.definition.version,
            },
        })
    }

    pub fn record_completed(&mut self, node_id: &str, output: Value) {
        self.outputs.insert(node_id.to_string(), output);
        self.failed_nodes.retain(|n| n != node_id);
        if !self.completed_nodes.iter().any(|n| n == node_id) {
            self.completed_nodes.push(node_id.to_string());
        }
        self.current_node_id = Some(node_id.to_string());
        self.touch();
    }

    pub fn record_failed(&mut self, node_id: &str) {
        if !self.failed_nodes.iter().any(|n| n == node_id) {
            self.failed_nodes.push(node_id.to_string());
        }
        self.touch();
    }

    /// Persisted form of the variable bag.
    pub fn context_data(&self) -> Value {
        json!({ "nodes": self.outputs, "vars": self.vars })
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            current_node_id: self.current_node_id.clone(),
            completed_nodes: self.completed_nodes.clone(),
            failed_nodes: self.failed_nodes.clone(),
            context_data: self.context_data(),
        }
    }
}

// ---------------------------------------------------------------------------
// ContextCache
// ---------------------------------------------------------------------------

pub type SharedContext = Arc<Mutex<ExecutionContext>>;

/// Lock a shared context. A poisoned lock is recovered: the context holds
/// plain data and every writer leaves it consistent between statements.
pub fn lock_context(ctx: &SharedContext) -> MutexGuard<'_, ExecutionContext> {
    ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Contexts keyed by workflow instance id.
#[derive(Debug, Clone, Default)]
pub struct ContextCache {
    entries: Arc<DashMap<i64, SharedContext>>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a context and return the shared handle.
    pub fn insert(&self, ctx: ExecutionContext) -> SharedContext {
        let id = ctx.instance_id;
        let shared = Arc::new(Mutex::new(ctx));
        self.entries.insert(id, shared.clone());
        shared
    }

    pub fn get(&self, instance_id: i64) -> Option<SharedContext> {
        self.entries.get(&instance_id).map(|e| e.value().clone())
    }

    pub fn remove(&self, instance_id: i64) -> Option<SharedContext> {
        self.entries.remove(&instance_id).map(|(_, ctx)| ctx)
    }

    pub fn set_status(&self, instance_id: i64, status: WorkflowStatus) {
        if let Some(ctx) = self.get(instance_id) {
            let mut guard = lock_context(&ctx);
            guard.status = status;
            guard.touch();
        }
    }

    pub fn status(&self, instance_id: i64) -> Option<WorkflowStatus> {
        self.get(instance_id).map(|ctx| lock_context(&ctx).status)
    }

    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Instances whose context is not at a safe point.
    pub fn in_flight(&self) -> Vec<i64> {
        self.snapshot()
            .into_iter()
            .filter(|(_, status, _)| !status.is_safe_point())
            .map(|(id, _, _)| id)
            .collect()
    }

    /// Terminal contexts idle for longer than `idle_timeout`.
    pub fn evictable(&self, idle_timeout: Duration) -> Vec<i64> {
        self.snapshot()
            .into_iter()
            .filter(|(_, status, idle)| status.is_terminal() && *idle >= idle_timeout)
            .map(|(id, _, _)| id)
            .collect()
    }

    /// Serialized size of every cached variable bag, in bytes.
    pub fn payload_bytes(&self) -> usize {
        let handles: Vec<SharedContext> = self.entries.iter().map(|e| e.value().clone()).collect();
        handles
            .iter()
            .map(|ctx| lock_context(ctx).context_data().to_string().len())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn snapshot(&self) -> Vec<(i64, WorkflowStatus, Duration)> {
        let handles: Vec<(i64, SharedContext)> = self
            .entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut out: Vec<_> = handles
            .into_iter()
            .map(|(id, ctx)| {
                let guard = lock_context(&ctx);
                (id, guard.status, guard.idle_for())
            })
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conductor_types::definition::{NodeDefinition, NodeKind, TaskNode, WorkflowConfig};

    fn definition() -> Arc<WorkflowDefinition> {
        Arc::new(WorkflowDefinition {
            id: "wf".to_string(),
            name: "WF".to_string(),
            version: "1.0.0".to_string(),
            description: None,
            inputs: vec![],
            nodes: vec![NodeDefinition {
                id: "a".to_string(),
                name: None,
                depends_on: vec![],
                max_retries: None,
                kind: NodeKind::Task(TaskNode {
                    executor: "echo".to_string(),
                    config: Value::Null,
                }),
            }],
            connections: vec![],
            config: WorkflowConfig::default(),
        })
    }

    fn instance(id: i64, status: WorkflowStatus) -> WorkflowInstance {
        WorkflowInstance {
            id,
            definition_id: "wf".to_string(),
            definition_version: "1.0.0".to_string(),
            status,
            input_data: json!({"region": "eu"}),
            output_data: None,
            context_data: json!({"nodes": {"a": {"ok": true}}, "vars": {"k": 1}}),
            business_key: None,
            mutex_key: None,
            external_id: None,
            parent_instance_id: None,
            parent_node_id: None,
            current_node_id: Some("a".to_string()),
            completed_nodes: vec!["a".to_string()],
            failed_nodes: vec![],
            lock_owner: None,
            lock_acquired_at: None,
            last_heartbeat: None,
            retry_count: 0,
            max_retries: 3,
            priority: 0,
            assigned_engine_id: None,
            error_details: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn restore_from_checkpoint() {
        let ctx = ExecutionContext::restore(&instance(1, WorkflowStatus::Running), definition(), 0);
        assert_eq!(ctx.output("a"), Some(&json!({"ok": true})));
        let vars = ctx.variables();
        assert_eq!(vars["input"]["region"], json!("eu"));
        assert_eq!(vars["nodes"]["a"]["ok"], json!(true));
        assert_eq!(vars["vars"]["k"], json!(1));
        assert_eq!(vars["instance"]["id"], json!(1));
    }

    #[test]
    fn record_completed_advances_checkpoint() {
        let mut ctx = ExecutionContext::restore(&instance(1, WorkflowStatus::Running), definition(), 0);
        ctx.record_failed("b");
        ctx.record_completed("b", json!(2));
        ctx.record_completed("b", json!(3));
        let cp = ctx.checkpoint();
        assert_eq!(cp.current_node_id.as_deref(), Some("b"));
        assert_eq!(cp.completed_nodes, vec!["a", "b"]);
        assert!(cp.failed_nodes.is_empty());
        assert_eq!(cp.context_data["nodes"]["b"], json!(3));
    }

    #[test]
    fn eviction_requires_terminal_status() {
        let cache = ContextCache::new();
        cache.insert(ExecutionContext::restore(&instance(1, WorkflowStatus::Completed), definition(), 0));
        cache.insert(ExecutionContext::restore(&instance(2, WorkflowStatus::Running), definition(), 0));
        cache.insert(ExecutionContext::restore(&instance(3, WorkflowStatus::Paused), definition(), 0));

        assert_eq!(cache.evictable(Duration::ZERO), vec![1]);
        assert!(cache.evictable(Duration::from_secs(3600)).is_empty());
        assert_eq!(cache.in_flight(), vec![2]);

        cache.set_status(2, WorkflowStatus::Failed);
        assert_eq!(cache.evictable(Duration::ZERO), vec![1, 2]);
        assert!(cache.in_flight().is_empty());
    }
}

//! In-process implementation of `WorkflowRepository`.
//!
//! All state lives behind one mutex, so every method (and every
//! `transaction` batch) is atomic. A batch is applied to a copy of the
//! state and swapped in only when every operation succeeds. Used for
//! embedding the engine without a database and by the core test suite.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use conductor_types::definition::WorkflowDefinition;
use conductor_types::error::{ErrorDetails, RepositoryError};
use conductor_types::instance::{Checkpoint, NewWorkflowInstance, WorkflowInstance, WorkflowStatus};
use conductor_types::node::{LoopProgress, NewNodeInstance, NodeInstance, NodeStatus, NodeUpdate};
use serde_json::Value;

use super::workflow::{RepositoryOp, WorkflowRepository};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Insertion order doubles as version recency.
    definitions: Vec<WorkflowDefinition>,
    instances: BTreeMap<i64, WorkflowInstance>,
    nodes: BTreeMap<i64, NodeInstance>,
    next_instance_id: i64,
    next_node_id: i64,
}

/// Mutex-guarded in-memory repository. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowRepository {
    state: Arc<Mutex<MemoryState>>,
    failing_transactions: Arc<AtomicU32>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `transaction` fail after applying
    /// their operations to the scratch copy, simulating a crash before commit.
    pub fn fail_next_transactions(&self, count: u32) {
        self.failing_transactions.store(count, Ordering::SeqCst);
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut MemoryState) -> Result<T, RepositoryError>,
    ) -> Result<T, RepositoryError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| RepositoryError::Query("repository state poisoned".to_string()))?;
        f(&mut guard)
    }
}

// ---------------------------------------------------------------------------
// State operations
// ---------------------------------------------------------------------------

impl MemoryState {
    fn instance_mut(&mut self, id: i64) -> Result<&mut WorkflowInstance, RepositoryError> {
        self.instances.get_mut(&id).ok_or(RepositoryError::NotFound)
    }

    fn node_mut(&mut self, id: i64) -> Result<&mut NodeInstance, RepositoryError> {
        self.nodes.get_mut(&id).ok_or(RepositoryError::NotFound)
    }

    fn find_node(&self, instance_id: i64, node_id: &str) -> Option<&NodeInstance> {
        self.nodes
            .values()
            .find(|n| n.workflow_instance_id == instance_id && n.node_id == node_id)
    }

    fn insert_node(&mut self, new: &NewNodeInstance) -> (NodeInstance, bool) {
        if let Some(existing) = self.find_node(new.workflow_instance_id, &new.node_id) {
            return (existing.clone(), false);
        }
        self.next_node_id += 1;
        let now = Utc::now();
        let node = NodeInstance {
            id: self.next_node_id,
            workflow_instance_id: new.workflow_instance_id,
            node_id: new.node_id.clone(),
            node_name: new.node_name.clone(),
            node_type: new.node_type,
            status: NodeStatus::Pending,
            parent_node_id: new.parent_node_id.clone(),
            child_index: new.child_index,
            parallel_index: new.parallel_index,
            parallel_group_id: new.parallel_group_id.clone(),
            depends_on: new.depends_on.clone(),
            input_data: new.input_data.clone(),
            output_data: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            max_retries: new.max_retries,
            loop_progress: new.loop_progress,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: now,
            updated_at: now,
        };
        self.nodes.insert(node.id, node.clone());
        (node, true)
    }

    fn update_status(
        &mut self,
        id: i64,
        status: WorkflowStatus,
        error: Option<&ErrorDetails>,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        let inst = self.instance_mut(id)?;
        inst.status = status;
        inst.error_details = error.cloned();
        if status == WorkflowStatus::Running && inst.started_at.is_none() {
            inst.started_at = Some(now);
        }
        inst.completed_at = if status.is_terminal() { Some(now) } else { None };
        inst.updated_at = now;
        Ok(())
    }

    fn update_checkpoint(&mut self, id: i64, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let inst = self.instance_mut(id)?;
        inst.current_node_id = checkpoint.current_node_id.clone();
        inst.completed_nodes = checkpoint.completed_nodes.clone();
        inst.failed_nodes = checkpoint.failed_nodes.clone();
        inst.context_data = checkpoint.context_data.clone();
        inst.updated_at = Utc::now();
        Ok(())
    }

    fn update_node(&mut self, id: i64, update: &NodeUpdate) -> Result<(), RepositoryError> {
        let node = self.node_mut(id)?;
        if update.status == NodeStatus::Running {
            node.output_data = None;
            node.error_message = None;
            node.error_details = None;
            node.completed_at = None;
            node.duration_ms = None;
        }
        node.status = update.status;
        if let Some(v) = &update.input_data {
            node.input_data = Some(v.clone());
        }
        if let Some(v) = &update.output_data {
            node.output_data = Some(v.clone());
        }
        if let Some(v) = &update.error_message {
            node.error_message = Some(v.clone());
        }
        if let Some(v) = &update.error_details {
            node.error_details = Some(v.clone());
        }
        if update.started_at.is_some() {
            node.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            node.completed_at = update.completed_at;
        }
        if update.duration_ms.is_some() {
            node.duration_ms = update.duration_ms;
        }
        if let Some(retry_count) = update.retry_count {
            node.retry_count = retry_count;
        }
        node.updated_at = Utc::now();
        Ok(())
    }

    fn update_loop_progress(&mut self, id: i64, progress: &LoopProgress) -> Result<(), RepositoryError> {
        let node = self.node_mut(id)?;
        node.loop_progress = Some(*progress);
        node.updated_at = Utc::now();
        Ok(())
    }

    fn update_child_status(
        &mut self,
        instance_id: i64,
        parent_node_id: &str,
        from: NodeStatus,
        to: NodeStatus,
    ) -> u64 {
        let now = Utc::now();
        let mut changed = 0;
        for node in self.nodes.values_mut() {
            if node.workflow_instance_id == instance_id
                && node.parent_node_id.as_deref() == Some(parent_node_id)
                && node.status == from
            {
                node.status = to;
                node.updated_at = now;
                changed += 1;
            }
        }
        changed
    }

    fn children(&self, instance_id: i64, parent_node_id: &str) -> Vec<NodeInstance> {
        let mut children: Vec<NodeInstance> = self
            .nodes
            .values()
            .filter(|n| {
                n.workflow_instance_id == instance_id
                    && n.parent_node_id.as_deref() == Some(parent_node_id)
            })
            .cloned()
            .collect();
        children.sort_by_key(|n| (n.child_index, n.parallel_index, n.id));
        children
    }

    fn apply(&mut self, op: &RepositoryOp) -> Result<(), RepositoryError> {
        match op {
            RepositoryOp::CreateNodes(nodes) => {
                for node in nodes {
                    self.insert_node(node);
                }
                Ok(())
            }
            RepositoryOp::UpdateNodeStatus { id, update } => self.update_node(*id, update),
            RepositoryOp::UpdateLoopProgress { id, progress } => {
                self.update_loop_progress(*id, progress)
            }
            RepositoryOp::UpdateChildStatus {
                instance_id,
                parent_node_id,
                from,
                to,
            } => {
                self.update_child_status(*instance_id, parent_node_id, *from, *to);
                Ok(())
            }
            RepositoryOp::UpdateStatus { id, status, error } => {
                self.update_status(*id, *status, error.as_ref())
            }
            RepositoryOp::UpdateCheckpoint { id, checkpoint } => {
                self.update_checkpoint(*id, checkpoint)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.with_state(|s| {
            s.definitions
                .retain(|d| !(d.id == def.id && d.version == def.version));
            s.definitions.push(def.clone());
            Ok(())
        })
    }

    async fn get_definition(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.definitions
                .iter()
                .rev()
                .find(|d| d.id == id && version.is_none_or(|v| d.version == v))
                .cloned())
        })
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        self.with_state(|s| {
            let mut latest: BTreeMap<String, WorkflowDefinition> = BTreeMap::new();
            for def in &s.definitions {
                latest.insert(def.id.clone(), def.clone());
            }
            Ok(latest.into_values().collect())
        })
    }

    async fn create_instance(
        &self,
        new: &NewWorkflowInstance,
    ) -> Result<WorkflowInstance, RepositoryError> {
        self.with_state(|s| {
            if let Some(ext) = &new.external_id {
                if s.instances
                    .values()
                    .any(|i| i.external_id.as_deref() == Some(ext.as_str()))
                {
                    return Err(RepositoryError::Conflict(format!(
                        "external id '{ext}' already exists"
                    )));
                }
            }
            if let Some(key) = &new.business_key {
                if s.instances.values().any(|i| i.business_key.as_ref() == Some(key) && i.holds_keys()) {
                    return Err(RepositoryError::Conflict(format!("business key '{key}' is held")));
                }
            }
            if let Some(key) = &new.mutex_key {
                if s.instances.values().any(|i| i.mutex_key.as_ref() == Some(key) && i.holds_keys()) {
                    return Err(RepositoryError::Conflict(format!("mutex key '{key}' is held")));
                }
            }
            s.next_instance_id += 1;
            let now = Utc::now();
            let inst = WorkflowInstance {
                id: s.next_instance_id,
                definition_id: new.definition_id.clone(),
                definition_version: new.definition_version.clone(),
                status: WorkflowStatus::Pending,
                input_data: new.input_data.clone(),
                output_data: None,
                context_data: Value::Object(Default::default()),
                business_key: new.business_key.clone(),
                mutex_key: new.mutex_key.clone(),
                external_id: new.external_id.clone(),
                parent_instance_id: new.parent_instance_id,
                parent_node_id: new.parent_node_id.clone(),
                current_node_id: None,
                completed_nodes: Vec::new(),
                failed_nodes: Vec::new(),
                lock_owner: None,
                lock_acquired_at: None,
                last_heartbeat: None,
                retry_count: 0,
                max_retries: new.max_retries,
                priority: new.priority,
                assigned_engine_id: new.assigned_engine_id.clone(),
                error_details: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            };
            s.instances.insert(inst.id, inst.clone());
            Ok(inst)
        })
    }

    async fn get_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, RepositoryError> {
        self.with_state(|s| Ok(s.instances.get(&id).cloned()))
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.instances
                .values()
                .find(|i| i.external_id.as_deref() == Some(external_id))
                .cloned())
        })
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.instances
                .values()
                .rev()
                .filter(|i| status.is_none_or(|st| i.status == st))
                .take(limit as usize)
                .cloned()
                .collect())
        })
    }

    async fn update_status(
        &self,
        id: i64,
        status: WorkflowStatus,
        error: Option<&ErrorDetails>,
    ) -> Result<(), RepositoryError> {
        self.with_state(|s| s.update_status(id, status, error))
    }

    async fn update_output(&self, id: i64, output: &Value) -> Result<(), RepositoryError> {
        self.with_state(|s| {
            let inst = s.instance_mut(id)?;
            inst.output_data = Some(output.clone());
            inst.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn update_checkpoint(
        &self,
        id: i64,
        checkpoint: &Checkpoint,
    ) -> Result<(), RepositoryError> {
        self.with_state(|s| s.update_checkpoint(id, checkpoint))
    }

    async fn update_lock_info(&self, id: i64, owner: Option<&str>) -> Result<(), RepositoryError> {
        self.with_state(|s| {
            let now = Utc::now();
            let inst = s.instance_mut(id)?;
            inst.lock_owner = owner.map(str::to_string);
            inst.lock_acquired_at = owner.map(|_| now);
            inst.last_heartbeat = Some(now);
            inst.updated_at = now;
            Ok(())
        })
    }

    async fn touch_heartbeat(&self, ids: &[i64]) -> Result<(), RepositoryError> {
        self.with_state(|s| {
            let now = Utc::now();
            for id in ids {
                if let Some(inst) = s.instances.get_mut(id) {
                    inst.last_heartbeat = Some(now);
                }
            }
            Ok(())
        })
    }

    async fn update_retry_count(&self, id: i64, retry_count: u32) -> Result<(), RepositoryError> {
        self.with_state(|s| {
            let inst = s.instance_mut(id)?;
            inst.retry_count = retry_count;
            inst.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn assign_engine(&self, id: i64, engine_id: Option<&str>) -> Result<(), RepositoryError> {
        self.with_state(|s| {
            let inst = s.instance_mut(id)?;
            inst.assigned_engine_id = engine_id.map(str::to_string);
            inst.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn find_interrupted_instances(
        &self,
        statuses: &[WorkflowStatus],
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.with_state(|s| {
            let mut found: Vec<WorkflowInstance> = s
                .instances
                .values()
                .filter(|i| statuses.contains(&i.status))
                .cloned()
                .collect();
            found.sort_by_key(|i| (std::cmp::Reverse(i.priority), i.id));
            found.truncate(limit as usize);
            Ok(found)
        })
    }

    async fn check_instance_lock(
        &self,
        definition_id: &str,
        exclude_statuses: &[WorkflowStatus],
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.instances
                .values()
                .filter(|i| i.definition_id == definition_id && !exclude_statuses.contains(&i.status))
                .cloned()
                .collect())
        })
    }

    async fn check_business_instance_lock(
        &self,
        business_key: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.instances
                .values()
                .filter(|i| i.business_key.as_deref() == Some(business_key) && i.holds_keys())
                .cloned()
                .collect())
        })
    }

    async fn check_mutex_instance_lock(
        &self,
        mutex_key: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.instances
                .values()
                .filter(|i| i.mutex_key.as_deref() == Some(mutex_key) && i.holds_keys())
                .cloned()
                .collect())
        })
    }

    async fn create_node(&self, node: &NewNodeInstance) -> Result<NodeInstance, RepositoryError> {
        self.with_state(|s| {
            if !s.instances.contains_key(&node.workflow_instance_id) {
                return Err(RepositoryError::NotFound);
            }
            Ok(s.insert_node(node).0)
        })
    }

    async fn create_nodes(&self, nodes: &[NewNodeInstance]) -> Result<u64, RepositoryError> {
        self.with_state(|s| {
            let mut inserted = 0;
            for node in nodes {
                if s.insert_node(node).1 {
                    inserted += 1;
                }
            }
            Ok(inserted)
        })
    }

    async fn get_node(&self, id: i64) -> Result<Option<NodeInstance>, RepositoryError> {
        self.with_state(|s| Ok(s.nodes.get(&id).cloned()))
    }

    async fn find_by_node_id(
        &self,
        instance_id: i64,
        node_id: &str,
    ) -> Result<Option<NodeInstance>, RepositoryError> {
        self.with_state(|s| Ok(s.find_node(instance_id, node_id).cloned()))
    }

    async fn find_child_nodes(
        &self,
        instance_id: i64,
        parent_node_id: &str,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        self.with_state(|s| Ok(s.children(instance_id, parent_node_id)))
    }

    async fn find_pending_child_nodes(
        &self,
        instance_id: i64,
        parent_node_id: &str,
        limit: u32,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.children(instance_id, parent_node_id)
                .into_iter()
                .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Running))
                .take(limit as usize)
                .collect())
        })
    }

    async fn list_nodes(&self, instance_id: i64) -> Result<Vec<NodeInstance>, RepositoryError> {
        self.with_state(|s| {
            Ok(s.nodes
                .values()
                .filter(|n| n.workflow_instance_id == instance_id)
                .cloned()
                .collect())
        })
    }

    async fn update_node_status(&self, id: i64, update: &NodeUpdate) -> Result<(), RepositoryError> {
        self.with_state(|s| s.update_node(id, update))
    }

    async fn update_loop_progress(
        &self,
        id: i64,
        progress: &LoopProgress,
    ) -> Result<(), RepositoryError> {
        self.with_state(|s| s.update_loop_progress(id, progress))
    }

    async fn update_child_status(
        &self,
        instance_id: i64,
        parent_node_id: &str,
        from: NodeStatus,
        to: NodeStatus,
    ) -> Result<u64, RepositoryError> {
        self.with_state(|s| Ok(s.update_child_status(instance_id, parent_node_id, from, to)))
    }

    async fn transaction(&self, ops: Vec<RepositoryOp>) -> Result<(), RepositoryError> {
        let fail = self
            .failing_transactions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.with_state(|s| {
            let mut scratch = s.clone();
            for op in &ops {
                scratch.apply(op)?;
            }
            if fail {
                return Err(RepositoryError::Query(
                    "transaction aborted before commit".to_string(),
                ));
            }
            *s = scratch;
            Ok(())
        })
    }
}

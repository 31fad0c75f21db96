//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `conductor-core` using sqlx with split
//! read/write pools. Definitions are stored as JSON blobs keyed by
//! `(id, version)`. Instance and node rows carry JSON text columns for
//! payloads, checkpoints and error details.
//!
//! Every write helper takes a `&mut SqliteConnection` so the same code runs
//! on a pooled writer connection or inside a `transaction` batch.

use conductor_core::repository::workflow::{RepositoryOp, WorkflowRepository};
use conductor_types::definition::WorkflowDefinition;
use conductor_types::error::{ErrorDetails, RepositoryError};
use conductor_types::instance::{Checkpoint, NewWorkflowInstance, WorkflowInstance, WorkflowStatus};
use conductor_types::node::{LoopProgress, NewNodeInstance, NodeInstance, NodeStatus, NodeType, NodeUpdate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Debug, Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct DefinitionRow {
    definition: String,
}

impl DefinitionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            definition: row.try_get("definition")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.definition)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

struct InstanceRow {
    id: i64,
    definition_id: String,
    definition_version: String,
    status: String,
    input_data: String,
    output_data: Option<String>,
    context_data: String,
    business_key: Option<String>,
    mutex_key: Option<String>,
    external_id: Option<String>,
    parent_instance_id: Option<i64>,
    parent_node_id: Option<String>,
    current_node_id: Option<String>,
    completed_nodes: String,
    failed_nodes: String,
    lock_owner: Option<String>,
    lock_acquired_at: Option<String>,
    last_heartbeat: Option<String>,
    retry_count: i64,
    max_retries: i64,
    priority: i64,
    assigned_engine_id: Option<String>,
    error_details: Option<String>,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl InstanceRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            definition_id: row.try_get("definition_id")?,
            definition_version: row.try_get("definition_version")?,
            status: row.try_get("status")?,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            context_data: row.try_get("context_data")?,
            business_key: row.try_get("business_key")?,
            mutex_key: row.try_get("mutex_key")?,
            external_id: row.try_get("external_id")?,
            parent_instance_id: row.try_get("parent_instance_id")?,
            parent_node_id: row.try_get("parent_node_id")?,
            current_node_id: row.try_get("current_node_id")?,
            completed_nodes: row.try_get("completed_nodes")?,
            failed_nodes: row.try_get("failed_nodes")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_acquired_at: row.try_get("lock_acquired_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            priority: row.try_get("priority")?,
            assigned_engine_id: row.try_get("assigned_engine_id")?,
            error_details: row.try_get("error_details")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_instance(self) -> Result<WorkflowInstance, RepositoryError> {
        let status: WorkflowStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(WorkflowInstance {
            id: self.id,
            definition_id: self.definition_id,
            definition_version: self.definition_version,
            status,
            input_data: parse_json(&self.input_data, "input_data")?,
            output_data: parse_json_opt(self.output_data.as_deref(), "output_data")?,
            context_data: parse_json(&self.context_data, "context_data")?,
            business_key: self.business_key,
            mutex_key: self.mutex_key,
            external_id: self.external_id,
            parent_instance_id: self.parent_instance_id,
            parent_node_id: self.parent_node_id,
            current_node_id: self.current_node_id,
            completed_nodes: parse_json(&self.completed_nodes, "completed_nodes")?,
            failed_nodes: parse_json(&self.failed_nodes, "failed_nodes")?,
            lock_owner: self.lock_owner,
            lock_acquired_at: parse_datetime_opt(self.lock_acquired_at.as_deref())?,
            last_heartbeat: parse_datetime_opt(self.last_heartbeat.as_deref())?,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            priority: self.priority as i32,
            assigned_engine_id: self.assigned_engine_id,
            error_details: parse_json_opt(self.error_details.as_deref(), "error_details")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            started_at: parse_datetime_opt(self.started_at.as_deref())?,
            completed_at: parse_datetime_opt(self.completed_at.as_deref())?,
        })
    }
}

struct NodeRow {
    id: i64,
    workflow_instance_id: i64,
    node_id: String,
    node_name: String,
    node_type: String,
    status: String,
    parent_node_id: Option<String>,
    child_index: Option<i64>,
    parallel_index: Option<i64>,
    parallel_group_id: Option<String>,
    depends_on: String,
    input_data: Option<String>,
    output_data: Option<String>,
    error_message: Option<String>,
    error_details: Option<String>,
    retry_count: i64,
    max_retries: i64,
    loop_progress: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl NodeRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_instance_id: row.try_get("workflow_instance_id")?,
            node_id: row.try_get("node_id")?,
            node_name: row.try_get("node_name")?,
            node_type: row.try_get("node_type")?,
            status: row.try_get("status")?,
            parent_node_id: row.try_get("parent_node_id")?,
            child_index: row.try_get("child_index")?,
            parallel_index: row.try_get("parallel_index")?,
            parallel_group_id: row.try_get("parallel_group_id")?,
            depends_on: row.try_get("depends_on")?,
            input_data: row.try_get("input_data")?,
            output_data: row.try_get("output_data")?,
            error_message: row.try_get("error_message")?,
            error_details: row.try_get("error_details")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            loop_progress: row.try_get("loop_progress")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_node(self) -> Result<NodeInstance, RepositoryError> {
        let node_type: NodeType = self.node_type.parse().map_err(RepositoryError::Query)?;
        let status: NodeStatus = self.status.parse().map_err(RepositoryError::Query)?;
        Ok(NodeInstance {
            id: self.id,
            workflow_instance_id: self.workflow_instance_id,
            node_id: self.node_id,
            node_name: self.node_name,
            node_type,
            status,
            parent_node_id: self.parent_node_id,
            child_index: self.child_index.map(|i| i as u32),
            parallel_index: self.parallel_index.map(|i| i as u32),
            parallel_group_id: self.parallel_group_id,
            depends_on: parse_json(&self.depends_on, "depends_on")?,
            input_data: parse_json_opt(self.input_data.as_deref(), "input_data")?,
            output_data: parse_json_opt(self.output_data.as_deref(), "output_data")?,
            error_message: self.error_message,
            error_details: parse_json_opt(self.error_details.as_deref(), "error_details")?,
            retry_count: self.retry_count as u32,
            max_retries: self.max_retries as u32,
            loop_progress: parse_json_opt(self.loop_progress.as_deref(), "loop_progress")?,
            started_at: parse_datetime_opt(self.started_at.as_deref())?,
            completed_at: parse_datetime_opt(self.completed_at.as_deref())?,
            duration_ms: self.duration_ms,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn parse_datetime_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(parse_datetime).transpose()
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

fn parse_json_opt<T: DeserializeOwned>(s: Option<&str>, column: &str) -> Result<Option<T>, RepositoryError> {
    s.map(|s| parse_json(s, column)).transpose()
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn to_json_opt<T: Serialize>(value: Option<&T>) -> Result<Option<String>, RepositoryError> {
    value.map(to_json).transpose()
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// `?, ?, ?` for an `IN (...)` list of `n` values.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn map_rows<T>(
    rows: &[SqliteRow],
    convert: impl Fn(&SqliteRow) -> Result<T, RepositoryError>,
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(convert).collect()
}

fn instance_from(row: &SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    InstanceRow::from_row(row).map_err(query_error)?.into_instance()
}

fn node_from(row: &SqliteRow) -> Result<NodeInstance, RepositoryError> {
    NodeRow::from_row(row).map_err(query_error)?.into_node()
}

/// Row-level form of `WorkflowInstance::holds_keys`.
const HOLDS_KEYS: &str = "(status IN ('pending', 'running', 'paused') \
     OR (status = 'failed' \
         AND json_extract(error_details, '$.retryable') = 1 \
         AND json_extract(error_details, '$.retry_count') < max_retries))";

/// Instances holding `key` in `column` (`business_key` or `mutex_key`).
async fn key_holders(
    conn: &mut SqliteConnection,
    column: &'static str,
    key: &str,
) -> Result<Vec<WorkflowInstance>, RepositoryError> {
    let sql = format!("SELECT * FROM workflow_instances WHERE {column} = ? AND {HOLDS_KEYS} ORDER BY id ASC");
    let rows = sqlx::query(&sql)
        .bind(key)
        .fetch_all(&mut *conn)
        .await
        .map_err(query_error)?;
    map_rows(&rows, instance_from)
}

// ---------------------------------------------------------------------------
// Write operations (shared by single calls and transactions)
// ---------------------------------------------------------------------------

/// Insert a node row unless `(workflow_instance_id, node_id)` exists.
/// Returns whether a row was inserted.
async fn insert_node(conn: &mut SqliteConnection, node: &NewNodeInstance) -> Result<bool, RepositoryError> {
    let now = format_datetime(&Utc::now());
    let result = sqlx::query(
        r#"INSERT INTO node_instances
           (workflow_instance_id, node_id, node_name, node_type, status, parent_node_id,
            child_index, parallel_index, parallel_group_id, depends_on, input_data,
            max_retries, loop_progress, created_at, updated_at)
           VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(workflow_instance_id, node_id) DO NOTHING"#,
    )
    .bind(node.workflow_instance_id)
    .bind(&node.node_id)
    .bind(&node.node_name)
    .bind(node.node_type.as_str())
    .bind(&node.parent_node_id)
    .bind(node.child_index.map(i64::from))
    .bind(node.parallel_index.map(i64::from))
    .bind(&node.parallel_group_id)
    .bind(to_json(&node.depends_on)?)
    .bind(to_json_opt(node.input_data.as_ref())?)
    .bind(i64::from(node.max_retries))
    .bind(to_json_opt(node.loop_progress.as_ref())?)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        _ => query_error(e),
    })?;
    Ok(result.rows_affected() > 0)
}

async fn write_status(
    conn: &mut SqliteConnection,
    id: i64,
    status: WorkflowStatus,
    error: Option<&ErrorDetails>,
) -> Result<(), RepositoryError> {
    let now = format_datetime(&Utc::now());
    let started_at = (status == WorkflowStatus::Running).then(|| now.clone());
    let completed_at = status.is_terminal().then(|| now.clone());

    let result = sqlx::query(
        r#"UPDATE workflow_instances SET
             status = ?,
             error_details = ?,
             started_at = COALESCE(started_at, ?),
             completed_at = ?,
             updated_at = ?
           WHERE id = ?"#,
    )
    .bind(status.as_str())
    .bind(to_json_opt(error)?)
    .bind(&started_at)
    .bind(&completed_at)
    .bind(&now)
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound);
    }
    Ok(())
}

async fn write_checkpoint(
    conn: &mut SqliteConnection,
    id: i64,
    checkpoint: &Checkpoint,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        r#"UPDATE workflow_instances SET
             current_node_id = ?,
             completed_nodes = ?,
             failed_nodes = ?,
             context_data = ?,
             updated_at = ?
           WHERE id = ?"#,
    )
    .bind(&checkpoint.current_node_id)
    .bind(to_json(&checkpoint.completed_nodes)?)
    .bind(to_json(&checkpoint.failed_nodes)?)
    .bind(to_json(&checkpoint.context_data)?)
    .bind(format_datetime(&Utc::now()))
    .bind(id)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound);
    }
    Ok(())
}

/// Fields left `None` keep their stored value.
const UPDATE_NODE_SQL: &str = r#"UPDATE node_instances SET
      status = ?,
      input_data = COALESCE(?, input_data),
      output_data = COALESCE(?, output_data),
      error_message = COALESCE(?, error_message),
      error_details = COALESCE(?, error_details),
      started_at = COALESCE(?, started_at),
      completed_at = COALESCE(?, completed_at),
      duration_ms = COALESCE(?, duration_ms),
      retry_count = COALESCE(?, retry_count),
      updated_at = ?
    WHERE id = ?"#;

/// A new attempt: results of the previous attempt are overwritten.
const RESTART_NODE_SQL: &str = r#"UPDATE node_instances SET
      status = ?,
      input_data = COALESCE(?, input_data),
      output_data = ?,
      error_message = ?,
      error_details = ?,
      started_at = COALESCE(?, started_at),
      completed_at = ?,
      duration_ms = ?,
      retry_count = COALESCE(?, retry_count),
      updated_at = ?
    WHERE id = ?"#;

async fn write_node_status(
    conn: &mut SqliteConnection,
    id: i64,
    update: &NodeUpdate,
) -> Result<(), RepositoryError> {
    let sql = if update.status == NodeStatus::Running {
        RESTART_NODE_SQL
    } else {
        UPDATE_NODE_SQL
    };
    let result = sqlx::query(sql)
        .bind(update.status.as_str())
        .bind(to_json_opt(update.input_data.as_ref())?)
        .bind(to_json_opt(update.output_data.as_ref())?)
        .bind(&update.error_message)
        .bind(to_json_opt(update.error_details.as_ref())?)
        .bind(update.started_at.as_ref().map(format_datetime))
        .bind(update.completed_at.as_ref().map(format_datetime))
        .bind(update.duration_ms)
        .bind(update.retry_count.map(i64::from))
        .bind(format_datetime(&Utc::now()))
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound);
    }
    Ok(())
}

async fn write_loop_progress(
    conn: &mut SqliteConnection,
    id: i64,
    progress: &LoopProgress,
) -> Result<(), RepositoryError> {
    let result = sqlx::query("UPDATE node_instances SET loop_progress = ?, updated_at = ? WHERE id = ?")
        .bind(to_json(progress)?)
        .bind(format_datetime(&Utc::now()))
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::NotFound);
    }
    Ok(())
}

async fn write_child_status(
    conn: &mut SqliteConnection,
    instance_id: i64,
    parent_node_id: &str,
    from: NodeStatus,
    to: NodeStatus,
) -> Result<u64, RepositoryError> {
    let result = sqlx::query(
        r#"UPDATE node_instances SET status = ?, updated_at = ?
           WHERE workflow_instance_id = ? AND parent_node_id = ? AND status = ?"#,
    )
    .bind(to.as_str())
    .bind(format_datetime(&Utc::now()))
    .bind(instance_id)
    .bind(parent_node_id)
    .bind(from.as_str())
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;
    Ok(result.rows_affected())
}

async fn apply(conn: &mut SqliteConnection, op: &RepositoryOp) -> Result<(), RepositoryError> {
    match op {
        RepositoryOp::CreateNodes(nodes) => {
            for node in nodes {
                insert_node(conn, node).await?;
            }
            Ok(())
        }
        RepositoryOp::UpdateNodeStatus { id, update } => write_node_status(conn, *id, update).await,
        RepositoryOp::UpdateLoopProgress { id, progress } => {
            write_loop_progress(conn, *id, progress).await
        }
        RepositoryOp::UpdateChildStatus {
            instance_id,
            parent_node_id,
            from,
            to,
        } => write_child_status(conn, *instance_id, parent_node_id, *from, *to)
            .await
            .map(|_| ()),
        RepositoryOp::UpdateStatus { id, status, error } => {
            write_status(conn, *id, *status, error.as_ref()).await
        }
        RepositoryOp::UpdateCheckpoint { id, checkpoint } => {
            write_checkpoint(conn, *id, checkpoint).await
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = serde_json::to_string(def)
            .map_err(|e| RepositoryError::Query(format!("serialize definition: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, version, name, definition, seq, saved_at)
               VALUES (?, ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM workflow_definitions), ?)
               ON CONFLICT(id, version) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 seq = excluded.seq,
                 saved_at = excluded.saved_at"#,
        )
        .bind(&def.id)
        .bind(&def.version)
        .bind(&def.name)
        .bind(&definition_json)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_definition(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = match version {
            Some(version) => {
                sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ? AND version = ?")
                    .bind(id)
                    .bind(version)
                    .fetch_optional(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query(
                    "SELECT definition FROM workflow_definitions WHERE id = ? ORDER BY seq DESC LIMIT 1",
                )
                .bind(id)
                .fetch_optional(&self.pool.reader)
                .await
            }
        }
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = DefinitionRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_definition()?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT d.definition FROM workflow_definitions d
               WHERE d.seq = (SELECT MAX(seq) FROM workflow_definitions WHERE id = d.id)
               ORDER BY d.id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        map_rows(&rows, |row| {
            DefinitionRow::from_row(row).map_err(query_error)?.into_definition()
        })
    }

    async fn create_instance(
        &self,
        new: &NewWorkflowInstance,
    ) -> Result<WorkflowInstance, RepositoryError> {
        let now = Utc::now();
        let now_str = format_datetime(&now);
        let context_data = Value::Object(Default::default());

        // The writer pool has one connection, so holder check and insert
        // cannot interleave with another create.
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        for (column, key) in [("business_key", &new.business_key), ("mutex_key", &new.mutex_key)] {
            if let Some(key) = key {
                if !key_holders(&mut tx, column, key).await?.is_empty() {
                    return Err(RepositoryError::Conflict(format!(
                        "{} '{key}' is held",
                        column.replace('_', " ")
                    )));
                }
            }
        }

        let result = sqlx::query(
            r#"INSERT INTO workflow_instances
               (definition_id, definition_version, status, input_data, context_data,
                business_key, mutex_key, external_id, parent_instance_id, parent_node_id,
                max_retries, priority, assigned_engine_id, created_at, updated_at)
               VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&new.definition_id)
        .bind(&new.definition_version)
        .bind(to_json(&new.input_data)?)
        .bind(to_json(&context_data)?)
        .bind(&new.business_key)
        .bind(&new.mutex_key)
        .bind(&new.external_id)
        .bind(new.parent_instance_id)
        .bind(&new.parent_node_id)
        .bind(i64::from(new.max_retries))
        .bind(i64::from(new.priority))
        .bind(&new.assigned_engine_id)
        .bind(&now_str)
        .bind(&now_str)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => RepositoryError::Conflict(format!(
                "external id '{}' already exists",
                new.external_id.as_deref().unwrap_or_default()
            )),
            _ => query_error(e),
        })?;
        tx.commit().await.map_err(query_error)?;

        Ok(WorkflowInstance {
            id: result.last_insert_rowid(),
            definition_id: new.definition_id.clone(),
            definition_version: new.definition_version.clone(),
            status: WorkflowStatus::Pending,
            input_data: new.input_data.clone(),
            output_data: None,
            context_data,
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
        })
    }

    async fn get_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(instance_from).transpose()
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_instances WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(instance_from).transpose()
    }

    async fn list_instances(
        &self,
        status: Option<WorkflowStatus>,
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM workflow_instances WHERE status = ? ORDER BY id DESC LIMIT ?")
                    .bind(status.as_str())
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM workflow_instances ORDER BY id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_error)?;
        map_rows(&rows, instance_from)
    }

    async fn update_status(
        &self,
        id: i64,
        status: WorkflowStatus,
        error: Option<&ErrorDetails>,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        write_status(&mut conn, id, status, error).await
    }

    async fn update_output(&self, id: i64, output: &Value) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflow_instances SET output_data = ?, updated_at = ? WHERE id = ?")
            .bind(to_json(output)?)
            .bind(format_datetime(&Utc::now()))
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_checkpoint(
        &self,
        id: i64,
        checkpoint: &Checkpoint,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        write_checkpoint(&mut conn, id, checkpoint).await
    }

    async fn update_lock_info(&self, id: i64, owner: Option<&str>) -> Result<(), RepositoryError> {
        let now = format_datetime(&Utc::now());
        let acquired_at = owner.map(|_| now.clone());
        let result = sqlx::query(
            r#"UPDATE workflow_instances SET
                 lock_owner = ?, lock_acquired_at = ?, last_heartbeat = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(owner)
        .bind(&acquired_at)
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn touch_heartbeat(&self, ids: &[i64]) -> Result<(), RepositoryError> {
        if ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE workflow_instances SET last_heartbeat = ? WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql).bind(format_datetime(&Utc::now()));
        for id in ids {
            query = query.bind(*id);
        }
        query.execute(&self.pool.writer).await.map_err(query_error)?;
        Ok(())
    }

    async fn update_retry_count(&self, id: i64, retry_count: u32) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE workflow_instances SET retry_count = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(retry_count))
            .bind(format_datetime(&Utc::now()))
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn assign_engine(&self, id: i64, engine_id: Option<&str>) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_instances SET assigned_engine_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(engine_id)
        .bind(format_datetime(&Utc::now()))
        .bind(id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn find_interrupted_instances(
        &self,
        statuses: &[WorkflowStatus],
        limit: u32,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM workflow_instances WHERE status IN ({}) ORDER BY priority DESC, id ASC LIMIT ?",
            placeholders(statuses.len())
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        map_rows(&rows, instance_from)
    }

    async fn check_instance_lock(
        &self,
        definition_id: &str,
        exclude_statuses: &[WorkflowStatus],
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let sql = if exclude_statuses.is_empty() {
            "SELECT * FROM workflow_instances WHERE definition_id = ? ORDER BY id ASC".to_string()
        } else {
            format!(
                "SELECT * FROM workflow_instances WHERE definition_id = ? AND status NOT IN ({}) ORDER BY id ASC",
                placeholders(exclude_statuses.len())
            )
        };
        let mut query = sqlx::query(&sql).bind(definition_id);
        for status in exclude_statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool.reader).await.map_err(query_error)?;
        map_rows(&rows, instance_from)
    }

    async fn check_business_instance_lock(
        &self,
        business_key: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_error)?;
        key_holders(&mut conn, "business_key", business_key).await
    }

    async fn check_mutex_instance_lock(
        &self,
        mutex_key: &str,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_error)?;
        key_holders(&mut conn, "mutex_key", mutex_key).await
    }

    async fn create_node(&self, node: &NewNodeInstance) -> Result<NodeInstance, RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        insert_node(&mut conn, node).await?;

        let row = sqlx::query("SELECT * FROM node_instances WHERE workflow_instance_id = ? AND node_id = ?")
            .bind(node.workflow_instance_id)
            .bind(&node.node_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_error)?
            .ok_or(RepositoryError::NotFound)?;
        node_from(&row)
    }

    async fn create_nodes(&self, nodes: &[NewNodeInstance]) -> Result<u64, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let mut inserted = 0;
        for node in nodes {
            if insert_node(&mut tx, node).await? {
                inserted += 1;
            }
        }
        tx.commit().await.map_err(query_error)?;
        Ok(inserted)
    }

    async fn get_node(&self, id: i64) -> Result<Option<NodeInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM node_instances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(node_from).transpose()
    }

    async fn find_by_node_id(
        &self,
        instance_id: i64,
        node_id: &str,
    ) -> Result<Option<NodeInstance>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM node_instances WHERE workflow_instance_id = ? AND node_id = ?")
            .bind(instance_id)
            .bind(node_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        row.as_ref().map(node_from).transpose()
    }

    async fn find_child_nodes(
        &self,
        instance_id: i64,
        parent_node_id: &str,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM node_instances
               WHERE workflow_instance_id = ? AND parent_node_id = ?
               ORDER BY child_index ASC, parallel_index ASC, id ASC"#,
        )
        .bind(instance_id)
        .bind(parent_node_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        map_rows(&rows, node_from)
    }

    async fn find_pending_child_nodes(
        &self,
        instance_id: i64,
        parent_node_id: &str,
        limit: u32,
    ) -> Result<Vec<NodeInstance>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM node_instances
               WHERE workflow_instance_id = ? AND parent_node_id = ?
                 AND status IN ('pending', 'running')
               ORDER BY child_index ASC, parallel_index ASC, id ASC
               LIMIT ?"#,
        )
        .bind(instance_id)
        .bind(parent_node_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        map_rows(&rows, node_from)
    }

    async fn list_nodes(&self, instance_id: i64) -> Result<Vec<NodeInstance>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM node_instances WHERE workflow_instance_id = ? ORDER BY id ASC")
            .bind(instance_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        map_rows(&rows, node_from)
    }

    async fn update_node_status(&self, id: i64, update: &NodeUpdate) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        write_node_status(&mut conn, id, update).await
    }

    async fn update_loop_progress(
        &self,
        id: i64,
        progress: &LoopProgress,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        write_loop_progress(&mut conn, id, progress).await
    }

    async fn update_child_status(
        &self,
        instance_id: i64,
        parent_node_id: &str,
        from: NodeStatus,
        to: NodeStatus,
    ) -> Result<u64, RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        write_child_status(&mut conn, instance_id, parent_node_id, from, to).await
    }

    async fn transaction(&self, ops: Vec<RepositoryOp>) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        for op in &ops {
            // Dropping `tx` on error rolls the batch back.
            apply(&mut tx, op).await?;
        }
        tx.commit().await.map_err(query_error)?;
        tracing::debug!(ops = ops.len(), "repository transaction committed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::definition::{NodeDefinition, NodeKind, TaskNode, WorkflowConfig};
    use conductor_types::error::ErrorCategory;
    use conductor_types::node::LoopPhase;
    use serde_json::json;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    async fn test_repo() -> SqliteWorkflowRepository {
        SqliteWorkflowRepository::new(test_pool().await)
    }

    fn sample_definition(version: &str) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "order-fulfilment".to_string(),
            name: "Order fulfilment".to_string(),
            version: version.to_string(),
            description: Some("Reserve stock and ship".to_string()),
            inputs: vec![],
            nodes: vec![NodeDefinition {
                id: "reserve".to_string(),
                name: None,
                depends_on: vec![],
                max_retries: None,
                kind: NodeKind::Task(TaskNode {
                    executor: "echo".to_string(),
                    config: json!({"sku": "A-1"}),
                }),
            }],
            connections: vec![],
            config: WorkflowConfig::default(),
        }
    }

    fn new_instance() -> NewWorkflowInstance {
        NewWorkflowInstance {
            definition_id: "order-fulfilment".to_string(),
            definition_version: "1.0.0".to_string(),
            input_data: json!({"order": 42}),
            max_retries: 2,
            ..Default::default()
        }
    }

    fn loop_children(instance_id: i64, count: u32) -> Vec<NewNodeInstance> {
        (0..count)
            .map(|i| {
                let mut n = NewNodeInstance::new(instance_id, format!("items[{i}]"), "items", NodeType::Task);
                n.parent_node_id = Some("items".to_string());
                n.child_index = Some(i);
                n.input_data = Some(json!({"item": i}));
                n
            })
            .collect()
    }

    // -- Definitions --

    #[tokio::test]
    async fn test_definition_versions_latest_wins() {
        let repo = test_repo().await;
        repo.save_definition(&sample_definition("1.0.0")).await.unwrap();
        repo.save_definition(&sample_definition("2.0.0")).await.unwrap();

        let latest = repo.get_definition("order-fulfilment", None).await.unwrap().unwrap();
        assert_eq!(latest.version, "2.0.0");
        let pinned = repo
            .get_definition("order-fulfilment", Some("1.0.0"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pinned.version, "1.0.0");

        // Re-registering an older version makes it the latest again.
        repo.save_definition(&sample_definition("1.0.0")).await.unwrap();
        let latest = repo.get_definition("order-fulfilment", None).await.unwrap().unwrap();
        assert_eq!(latest.version, "1.0.0");

        let all = repo.list_definitions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(repo.get_definition("missing", None).await.unwrap().is_none());
    }

    // -- Instances --

    #[tokio::test]
    async fn test_instance_lifecycle_timestamps() {
        let repo = test_repo().await;
        let inst = repo.create_instance(&new_instance()).await.unwrap();
        assert_eq!(inst.status, WorkflowStatus::Pending);

        repo.update_status(inst.id, WorkflowStatus::Running, None).await.unwrap();
        let running = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let details = ErrorDetails::new(ErrorCategory::Timeout, "slow upstream");
        repo.update_status(inst.id, WorkflowStatus::Failed, Some(&details))
            .await
            .unwrap();
        let failed = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(failed.status, WorkflowStatus::Failed);
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.error_details.unwrap().message, "slow upstream");
        assert_eq!(failed.started_at, running.started_at);

        repo.update_status(inst.id, WorkflowStatus::Running, None).await.unwrap();
        let retried = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert!(retried.completed_at.is_none());
        assert!(retried.error_details.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_external_id_conflicts() {
        let repo = test_repo().await;
        let mut new = new_instance();
        new.external_id = Some("7:sub".to_string());
        repo.create_instance(&new).await.unwrap();

        let err = repo.create_instance(&new).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        let found = repo.find_by_external_id("7:sub").await.unwrap().unwrap();
        assert_eq!(found.input_data, json!({"order": 42}));
    }

    #[tokio::test]
    async fn test_checkpoint_and_lock_info_roundtrip() {
        let repo = test_repo().await;
        let inst = repo.create_instance(&new_instance()).await.unwrap();

        let checkpoint = Checkpoint {
            current_node_id: Some("reserve".to_string()),
            completed_nodes: vec!["reserve".to_string()],
            failed_nodes: vec![],
            context_data: json!({"nodes": {"reserve": {"ok": true}}, "vars": {}}),
        };
        repo.update_checkpoint(inst.id, &checkpoint).await.unwrap();
        repo.update_lock_info(inst.id, Some("engine-a")).await.unwrap();
        repo.assign_engine(inst.id, Some("engine-a")).await.unwrap();
        repo.update_retry_count(inst.id, 1).await.unwrap();

        let loaded = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_node_id.as_deref(), Some("reserve"));
        assert_eq!(loaded.completed_nodes, vec!["reserve"]);
        assert_eq!(loaded.context_data["nodes"]["reserve"]["ok"], json!(true));
        assert_eq!(loaded.lock_owner.as_deref(), Some("engine-a"));
        assert!(loaded.lock_acquired_at.is_some());
        assert_eq!(loaded.assigned_engine_id.as_deref(), Some("engine-a"));
        assert_eq!(loaded.retry_count, 1);
        assert!(loaded.has_checkpoint());

        repo.update_lock_info(inst.id, None).await.unwrap();
        let released = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert!(released.lock_owner.is_none());
        assert!(released.last_heartbeat.is_some());

        assert!(matches!(
            repo.update_checkpoint(9999, &checkpoint).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_interrupted_instances_by_priority() {
        let repo = test_repo().await;
        let low = repo.create_instance(&new_instance()).await.unwrap();
        let mut urgent = new_instance();
        urgent.priority = 10;
        let high = repo.create_instance(&urgent).await.unwrap();
        let done = repo.create_instance(&new_instance()).await.unwrap();

        for id in [low.id, high.id, done.id] {
            repo.update_status(id, WorkflowStatus::Running, None).await.unwrap();
        }
        repo.update_status(done.id, WorkflowStatus::Completed, None).await.unwrap();

        let found = repo
            .find_interrupted_instances(&[WorkflowStatus::Pending, WorkflowStatus::Running], 10)
            .await
            .unwrap();
        let ids: Vec<i64> = found.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);

        let limited = repo
            .find_interrupted_instances(&[WorkflowStatus::Running], 1)
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert!(repo.find_interrupted_instances(&[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instance_and_business_locks() {
        let repo = test_repo().await;
        let mut keyed = new_instance();
        keyed.business_key = Some("order-42".to_string());
        let first = repo.create_instance(&keyed).await.unwrap();

        assert_eq!(repo.check_business_instance_lock("order-42").await.unwrap().len(), 1);
        let active = repo
            .check_instance_lock("order-fulfilment", &WorkflowStatus::TERMINAL)
            .await
            .unwrap();
        assert_eq!(active.len(), 1);

        repo.update_status(first.id, WorkflowStatus::Cancelled, None).await.unwrap();
        assert!(repo.check_business_instance_lock("order-42").await.unwrap().is_empty());
        assert!(repo
            .check_instance_lock("order-fulfilment", &WorkflowStatus::TERMINAL)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(repo.check_instance_lock("order-fulfilment", &[]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_held_keys_block_create_until_retries_run_out() {
        let repo = test_repo().await;
        let mut keyed = new_instance();
        keyed.business_key = Some("order-42".to_string());
        keyed.mutex_key = Some("dock-3".to_string());
        keyed.max_retries = 2;
        let first = repo.create_instance(&keyed).await.unwrap();

        let err = repo.create_instance(&keyed).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(ref m) if m.contains("business key")));
        let mut same_dock = keyed.clone();
        same_dock.business_key = Some("order-43".to_string());
        let err = repo.create_instance(&same_dock).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(ref m) if m.contains("mutex key")));

        let mut transient = ErrorDetails::new(ErrorCategory::Connection, "connection reset");
        transient.retry_count = 1;
        repo.update_status(first.id, WorkflowStatus::Running, None).await.unwrap();
        repo.update_status(first.id, WorkflowStatus::Failed, Some(&transient)).await.unwrap();
        assert_eq!(repo.check_business_instance_lock("order-42").await.unwrap().len(), 1);
        assert_eq!(repo.check_mutex_instance_lock("dock-3").await.unwrap().len(), 1);
        assert!(repo.create_instance(&keyed).await.is_err());

        transient.retry_count = 2;
        repo.update_status(first.id, WorkflowStatus::Running, None).await.unwrap();
        repo.update_status(first.id, WorkflowStatus::Failed, Some(&transient)).await.unwrap();
        assert!(repo.check_business_instance_lock("order-42").await.unwrap().is_empty());
        let second = repo.create_instance(&keyed).await.unwrap();
        assert_eq!(repo.check_mutex_instance_lock("dock-3").await.unwrap()[0].id, second.id);
    }

    #[tokio::test]
    async fn test_list_instances_newest_first() {
        let repo = test_repo().await;
        let a = repo.create_instance(&new_instance()).await.unwrap();
        let b = repo.create_instance(&new_instance()).await.unwrap();
        repo.update_status(a.id, WorkflowStatus::Running, None).await.unwrap();

        let all = repo.list_instances(None, 10).await.unwrap();
        assert_eq!(all.iter().map(|i| i.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        let running = repo.list_instances(Some(WorkflowStatus::Running), 10).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
    }

    // -- Nodes --

    #[tokio::test]
    async fn test_create_node_is_idempotent() {
        let repo = test_repo().await;
        let inst = repo.create_instance(&new_instance()).await.unwrap();
        let mut new = NewNodeInstance::new(inst.id, "reserve", "Reserve", NodeType::Task);
        new.depends_on = vec!["validate".to_string()];

        let first = repo.create_node(&new).await.unwrap();
        let second = repo.create_node(&new).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.depends_on, vec!["validate"]);
        assert_eq!(first.status, NodeStatus::Pending);
        assert_eq!(repo.list_nodes(inst.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_node_for_missing_instance() {
        let repo = test_repo().await;
        let new = NewNodeInstance::new(404, "a", "A", NodeType::Task);
        assert!(matches!(repo.create_node(&new).await, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn test_node_status_transitions() {
        let repo = test_repo().await;
        let inst = repo.create_instance(&new_instance()).await.unwrap();
        let node = repo
            .create_node(&NewNodeInstance::new(inst.id, "reserve", "Reserve", NodeType::Task))
            .await
            .unwrap();

        repo.update_node_status(node.id, &NodeUpdate::running(json!({"sku": "A-1"}), 0))
            .await
            .unwrap();
        let details = ErrorDetails::new(ErrorCategory::Connection, "refused");
        repo.update_node_status(node.id, &NodeUpdate::failed(details, Some(json!({"partial": 1})), 12))
            .await
            .unwrap();
        let failed = repo.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(failed.status, NodeStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("refused"));
        assert_eq!(failed.input_data, Some(json!({"sku": "A-1"})));
        assert_eq!(failed.duration_ms, Some(12));

        repo.update_node_status(node.id, &NodeUpdate::running(json!({"sku": "A-1"}), 1))
            .await
            .unwrap();
        let rerun = repo.find_by_node_id(inst.id, "reserve").await.unwrap().unwrap();
        assert_eq!(rerun.status, NodeStatus::Running);
        assert_eq!(rerun.retry_count, 1);
        assert!(rerun.output_data.is_none());
        assert!(rerun.error_details.is_none());
        assert!(rerun.completed_at.is_none());

        repo.update_node_status(node.id, &NodeUpdate::completed(json!({"reserved": true}), 5))
            .await
            .unwrap();
        let done = repo.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(done.output_data, Some(json!({"reserved": true})));
        assert!(done.started_at.is_some());
    }

    #[tokio::test]
    async fn test_child_queries_and_bulk_status() {
        let repo = test_repo().await;
        let inst = repo.create_instance(&new_instance()).await.unwrap();
        assert_eq!(repo.create_nodes(&loop_children(inst.id, 4)).await.unwrap(), 4);
        assert_eq!(repo.create_nodes(&loop_children(inst.id, 5)).await.unwrap(), 1);

        let children = repo.find_child_nodes(inst.id, "items").await.unwrap();
        let ids: Vec<&str> = children.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(ids, vec!["items[0]", "items[1]", "items[2]", "items[3]", "items[4]"]);

        repo.update_node_status(children[0].id, &NodeUpdate::completed(json!(0), 1))
            .await
            .unwrap();
        repo.update_node_status(children[1].id, &NodeUpdate::running(json!(1), 0))
            .await
            .unwrap();
        let pending = repo.find_pending_child_nodes(inst.id, "items", 3).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|c| c.node_id.as_str()).collect();
        assert_eq!(ids, vec!["items[1]", "items[2]", "items[3]"]);

        let skipped = repo
            .update_child_status(inst.id, "items", NodeStatus::Pending, NodeStatus::Skipped)
            .await
            .unwrap();
        assert_eq!(skipped, 3);
        assert_eq!(
            repo.find_pending_child_nodes(inst.id, "items", 10).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_transaction_is_atomic() {
        let repo = test_repo().await;
        let inst = repo.create_instance(&new_instance()).await.unwrap();
        let parent = repo
            .create_node(&NewNodeInstance::new(inst.id, "items", "items", NodeType::Loop))
            .await
            .unwrap();

        // The progress update targets a missing row, so the whole batch rolls back.
        let broken = vec![
            RepositoryOp::CreateNodes(loop_children(inst.id, 3)),
            RepositoryOp::UpdateLoopProgress {
                id: parent.id + 1000,
                progress: LoopProgress::executing(3),
            },
        ];
        assert!(repo.transaction(broken).await.is_err());
        assert!(repo.find_child_nodes(inst.id, "items").await.unwrap().is_empty());

        let ops = vec![
            RepositoryOp::CreateNodes(loop_children(inst.id, 3)),
            RepositoryOp::UpdateLoopProgress {
                id: parent.id,
                progress: LoopProgress::executing(3),
            },
            RepositoryOp::UpdateStatus {
                id: inst.id,
                status: WorkflowStatus::Running,
                error: None,
            },
        ];
        repo.transaction(ops.clone()).await.unwrap();
        // Replaying the same batch creates no duplicate children.
        repo.transaction(ops).await.unwrap();

        assert_eq!(repo.find_child_nodes(inst.id, "items").await.unwrap().len(), 3);
        let parent = repo.get_node(parent.id).await.unwrap().unwrap();
        let progress = parent.loop_progress.unwrap();
        assert_eq!(progress.status, LoopPhase::Executing);
        assert_eq!(progress.total_count, 3);
        let inst = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert_eq!(inst.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn test_touch_heartbeat() {
        let repo = test_repo().await;
        let inst = repo.create_instance(&new_instance()).await.unwrap();
        assert!(inst.last_heartbeat.is_none());
        repo.touch_heartbeat(&[inst.id, 999]).await.unwrap();
        repo.touch_heartbeat(&[]).await.unwrap();
        let loaded = repo.get_instance(inst.id).await.unwrap().unwrap();
        assert!(loaded.last_heartbeat.is_some());
    }
}

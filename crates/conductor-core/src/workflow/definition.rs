//! Workflow definition parsing, validation, and input materialization.
//!
//! Definitions are authored in YAML or JSON. Validation checks the
//! structural constraints every engine relies on before an instance is
//! persisted: non-empty node list, unique ids, known edge endpoints, an
//! acyclic graph, and sane composite-node settings.

use std::collections::HashSet;
use std::path::Path;

use conductor_types::definition::{NodeDefinition, NodeKind, WorkflowDefinition};
use serde_json::{Map, Value};
use thiserror::Error;

use super::dag;
use super::error::EngineError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from loading a definition file.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Invalid(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML or JSON document into a validated definition.
pub fn parse_definition(content: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let def: WorkflowDefinition = if content.trim_start().starts_with('{') {
        serde_json::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?
    } else {
        serde_yaml_ng::from_str(content).map_err(|e| DefinitionError::Parse(e.to_string()))?
    };
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a definition to YAML.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
    serde_yaml_ng::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
}

pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_definition(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition.
///
/// Checks:
/// - Id is non-empty and at least one node exists
/// - Node ids are unique within their sequence and free of the characters
///   used to derive child ids (`/`, `[`, `]`)
/// - Every `depends_on` and connection endpoint names a top-level node
/// - The top-level graph is acyclic
/// - Loop concurrency and batch size are >= 1
/// - Declared input names are unique
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), EngineError> {
    if def.id.trim().is_empty() {
        return Err(EngineError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.nodes.is_empty() {
        return Err(EngineError::Validation(format!(
            "workflow '{}' must have at least one node",
            def.id
        )));
    }

    let mut inputs = HashSet::new();
    for input in &def.inputs {
        if !inputs.insert(input.name.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate input '{}'",
                input.name
            )));
        }
    }

    validate_sequence(&def.nodes, "workflow")?;
    dag::validate_graph(&def.nodes, &def.connections)
}

/// Validate one node sequence (top level or a composite node's branch).
fn validate_sequence(nodes: &[NodeDefinition], owner: &str) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for node in nodes {
        if node.id.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "{owner} contains a node with an empty id"
            )));
        }
        if node.id.contains(['/', '[', ']']) {
            return Err(EngineError::Validation(format!(
                "node id '{}' must not contain '/', '[' or ']'",
                node.id
            )));
        }
        if !seen.insert(node.id.as_str()) {
            return Err(EngineError::Validation(format!(
                "duplicate node id '{}' in {owner}",
                node.id
            )));
        }
        validate_node(node)?;
    }
    Ok(())
}

fn validate_node(node: &NodeDefinition) -> Result<(), EngineError> {
    match &node.kind {
        NodeKind::Task(task) => {
            if task.executor.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "task node '{}' has no executor",
                    node.id
                )));
            }
        }
        NodeKind::Loop(lp) => {
            if lp.max_concurrency == 0 {
                return Err(EngineError::Validation(format!(
                    "loop node '{}': max_concurrency must be >= 1",
                    node.id
                )));
            }
            if lp.batch_size == 0 {
                return Err(EngineError::Validation(format!(
                    "loop node '{}': batch_size must be >= 1",
                    node.id
                )));
            }
            if lp.body.executor.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "loop node '{}' has no body executor",
                    node.id
                )));
            }
        }
        NodeKind::Parallel(par) => {
            if par.branches.is_empty() {
                return Err(EngineError::Validation(format!(
                    "parallel node '{}' must have at least one branch",
                    node.id
                )));
            }
            for (i, branch) in par.branches.iter().enumerate() {
                let owner = format!("branch {i} of parallel node '{}'", node.id);
                validate_sequence(&branch.nodes, &owner)?;
            }
        }
        NodeKind::Condition(cond) => {
            if cond.expression.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "condition node '{}' has an empty expression",
                    node.id
                )));
            }
            validate_sequence(&cond.when_true, &format!("true branch of '{}'", node.id))?;
            validate_sequence(&cond.when_false, &format!("false branch of '{}'", node.id))?;
        }
        NodeKind::Subprocess(sub) => {
            if sub.definition_id.trim().is_empty() {
                return Err(EngineError::Validation(format!(
                    "subprocess node '{}' has no definition_id",
                    node.id
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Check required inputs and fill in declared defaults.
///
/// Undeclared inputs pass through unchanged. `null` is treated as an empty
/// input object.
pub fn materialize_inputs(def: &WorkflowDefinition, provided: &Value) -> Result<Value, EngineError> {
    let mut inputs: Map<String, Value> = match provided {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        other => {
            return Err(EngineError::Validation(format!(
                "workflow inputs must be an object, got {other}"
            )));
        }
    };

    for param in &def.inputs {
        if inputs.get(&param.name).is_some_and(|v| !v.is_null()) {
            continue;
        }
        match (&param.default, param.required) {
            (Some(default), _) => {
                inputs.insert(param.name.clone(), default.clone());
            }
            (None, true) => {
                return Err(EngineError::Validation(format!(
                    "missing required input '{}'",
                    param.name
                )));
            }
            (None, false) => {}
        }
    }

    Ok(Value::Object(inputs))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

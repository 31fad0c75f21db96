//! Graph resolver: execution order of top-level nodes.
//!
//! Uses `petgraph` to model node dependencies as a directed graph. Explicit
//! `connections` are ordered with Kahn's algorithm, `depends_on`-only graphs
//! with a depth-first dependency walk, and graphs without edges keep their
//! declaration order. Ties always break by declaration order so the same
//! definition yields the same schedule on every engine.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use conductor_types::definition::{Connection, NodeDefinition};
use conductor_types::node::{NodeInstance, NodeStatus};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use super::error::EngineError;

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Dependency graph over top-level nodes. Edges point dependency -> dependent.
struct NodeGraph<'a> {
    nodes: &'a [NodeDefinition],
    graph: DiGraph<usize, ()>,
    indices: Vec<NodeIndex>,
}

impl<'a> NodeGraph<'a> {
    fn build(nodes: &'a [NodeDefinition], connections: &[Connection]) -> Result<Self, EngineError> {
        let mut id_to_pos: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (pos, node) in nodes.iter().enumerate() {
            if id_to_pos.insert(node.id.as_str(), pos).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut graph = DiGraph::<usize, ()>::new();
        let indices: Vec<_> = (0..nodes.len()).map(|pos| graph.add_node(pos)).collect();

        let lookup = |owner: &str, id: &str| {
            id_to_pos.get(id).copied().ok_or_else(|| {
                EngineError::Validation(format!("node '{owner}' depends on unknown node '{id}'"))
            })
        };

        for (pos, node) in nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let from = lookup(&node.id, dep)?;
                graph.update_edge(indices[from], indices[pos], ());
            }
        }
        for conn in connections {
            let to = id_to_pos.get(conn.target.as_str()).copied().ok_or_else(|| {
                EngineError::Validation(format!(
                    "connection from '{}' targets unknown node '{}'",
                    conn.source, conn.target
                ))
            })?;
            let from = lookup(&conn.target, &conn.source)?;
            graph.update_edge(indices[from], indices[to], ());
        }

        Ok(Self {
            nodes,
            graph,
            indices,
        })
    }

    fn dependencies(&self, pos: usize) -> Vec<usize> {
        let mut deps: Vec<usize> = self
            .graph
            .neighbors_directed(self.indices[pos], Direction::Incoming)
            .map(|idx| self.graph[idx])
            .collect();
        deps.sort_unstable();
        deps
    }

    fn dependents(&self, pos: usize) -> Vec<usize> {
        self.graph
            .neighbors_directed(self.indices[pos], Direction::Outgoing)
            .map(|idx| self.graph[idx])
            .collect()
    }

    /// Kahn's algorithm with a min-heap on declaration position.
    fn kahn(&self) -> Result<Vec<usize>, EngineError> {
        let mut in_degree: Vec<usize> = (0..self.nodes.len())
            .map(|pos| self.dependencies(pos).len())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(pos, _)| Reverse(pos))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(pos)) = ready.pop() {
            order.push(pos);
            for next in self.dependents(pos) {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() < self.nodes.len() {
            // Leftover nodes sit on or behind a cycle; name one that is on it.
            return Err(self.find_cycle().unwrap_or_else(|| {
                let stuck = (0..self.nodes.len()).find(|p| !order.contains(p)).unwrap_or(0);
                EngineError::CircularDependency(self.nodes[stuck].id.clone())
            }));
        }
        Ok(order)
    }

    /// Depth-first dependency walk in declaration order. A node reached
    /// again while still on the current path closes a cycle.
    fn dependency_order(&self) -> Result<Vec<usize>, EngineError> {
        let mut state = vec![Visit::New; self.nodes.len()];
        let mut order = Vec::with_capacity(self.nodes.len());
        for pos in 0..self.nodes.len() {
            self.visit(pos, &mut state, &mut order)?;
        }
        Ok(order)
    }

    fn visit(&self, pos: usize, state: &mut [Visit], order: &mut Vec<usize>) -> Result<(), EngineError> {
        match state[pos] {
            Visit::Done => return Ok(()),
            Visit::InPath => {
                return Err(EngineError::CircularDependency(self.nodes[pos].id.clone()));
            }
            Visit::New => {}
        }
        state[pos] = Visit::InPath;
        for dep in self.dependencies(pos) {
            self.visit(dep, state, order)?;
        }
        state[pos] = Visit::Done;
        order.push(pos);
        Ok(())
    }

    fn find_cycle(&self) -> Option<EngineError> {
        self.dependency_order().err()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    New,
    InPath,
    Done,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Resolve the execution order of `nodes`.
///
/// Fails with [`EngineError::CircularDependency`] on a cycle and
/// [`EngineError::Validation`] on duplicate ids or edges naming unknown
/// nodes. No partial order is returned on failure.
pub fn resolve_order<'a>(
    nodes: &'a [NodeDefinition],
    connections: &[Connection],
) -> Result<Vec<&'a NodeDefinition>, EngineError> {
    if nodes.is_empty() {
        return Ok(vec![]);
    }

    let graph = NodeGraph::build(nodes, connections)?;
    let order = if !connections.is_empty() {
        graph.kahn()?
    } else if nodes.iter().any(|n| !n.depends_on.is_empty()) {
        graph.dependency_order()?
    } else {
        (0..nodes.len()).collect()
    };

    Ok(order.into_iter().map(|pos| &nodes[pos]).collect())
}

/// Validate that `nodes` form a DAG without resolving the order.
pub fn validate_graph(nodes: &[NodeDefinition], connections: &[Connection]) -> Result<(), EngineError> {
    resolve_order(nodes, connections).map(|_| ())
}

/// Drop nodes whose persisted row is already `completed`, keeping the
/// relative order of the rest. Used when resuming from a checkpoint.
pub fn pending_from_checkpoint<'a>(
    order: Vec<&'a NodeDefinition>,
    persisted: &[NodeInstance],
) -> Vec<&'a NodeDefinition> {
    order
        .into_iter()
        .filter(|node| {
            !persisted
                .iter()
                .any(|row| row.node_id == node.id && row.status == NodeStatus::Completed)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conductor_types::definition::{NodeKind, TaskNode};
    use conductor_types::node::NodeType;
    use serde_json::Value;

    fn task(id: &str, depends_on: &[&str]) -> NodeDefinition {
        NodeDefinition {
            id: id.to_string(),
            name: None,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            max_retries: None,
            kind: NodeKind::Task(TaskNode {
                executor: "echo".to_string(),
                config: Value::Null,
            }),
        }
    }

    fn conn(source: &str, target: &str) -> Connection {
        Connection {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    fn ids(order: &[&NodeDefinition]) -> Vec<String> {
        order.iter().map(|n| n.id.clone()).collect()
    }

    fn persisted(node_id: &str, status: NodeStatus) -> NodeInstance {
        NodeInstance {
            id: 1,
            workflow_instance_id: 1,
            node_id: node_id.to_string(),
            node_name: node_id.to_string(),
            node_type: NodeType::Task,
            status,
            parent_node_id: None,
            child_index: None,
            parallel_index: None,
            parallel_group_id: None,
            depends_on: vec![],
            input_data: None,
            output_data: None,
            error_message: None,
            error_details: None,
            retry_count: 0,
            max_retries: 0,
            loop_progress: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn declaration_order_without_edges() {
        let nodes = vec![task("c", &[]), task("a", &[]), task("b", &[])];
        let order = resolve_order(&nodes, &[]).unwrap();
        assert_eq!(ids(&order), vec!["c", "a", "b"]);
    }

    #[test]
    fn depends_on_places_dependencies_first() {
        let nodes = vec![task("c", &["b"]), task("b", &["a"]), task("a", &[])];
        let order = resolve_order(&nodes, &[]).unwrap();
        assert_eq!(ids(&order), vec!["a", "b", "c"]);
    }

    #[test]
    fn kahn_breaks_ties_by_declaration_order() {
        let nodes = vec![task("d", &[]), task("b", &[]), task("a", &[]), task("c", &[])];
        let connections = vec![conn("a", "d"), conn("b", "d"), conn("c", "d")];
        let order = resolve_order(&nodes, &connections).unwrap();
        assert_eq!(ids(&order), vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn every_edge_respected() {
        let nodes = vec![
            task("report", &["merge"]),
            task("merge", &[]),
            task("left", &["fetch"]),
            task("right", &["fetch"]),
            task("fetch", &[]),
        ];
        let connections = vec![conn("left", "merge"), conn("right", "merge")];
        let order = ids(&resolve_order(&nodes, &connections).unwrap());
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("fetch") < pos("left"));
        assert!(pos("fetch") < pos("right"));
        assert!(pos("left") < pos("merge"));
        assert!(pos("right") < pos("merge"));
        assert!(pos("merge") < pos("report"));
    }

    #[test]
    fn cycle_in_depends_on_is_rejected() {
        let nodes = vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"])];
        match resolve_order(&nodes, &[]) {
            Err(EngineError::CircularDependency(id)) => {
                assert!(["a", "b", "c"].contains(&id.as_str()))
            }
            other => panic!("expected cycle, got {:?}", other.map(|o| ids(&o))),
        }
    }

    #[test]
    fn cycle_in_connections_names_a_node_on_the_cycle() {
        let nodes = vec![task("start", &[]), task("x", &[]), task("y", &[])];
        let connections = vec![conn("start", "x"), conn("x", "y"), conn("y", "x")];
        match resolve_order(&nodes, &connections) {
            Err(EngineError::CircularDependency(id)) => assert!(id == "x" || id == "y"),
            other => panic!("expected cycle, got {:?}", other.map(|o| ids(&o))),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let nodes = vec![task("a", &["a"])];
        assert!(matches!(
            resolve_order(&nodes, &[]),
            Err(EngineError::CircularDependency(id)) if id == "a"
        ));
    }

    #[test]
    fn unknown_dependency_is_validation_error() {
        let nodes = vec![task("a", &["ghost"])];
        match resolve_order(&nodes, &[]) {
            Err(EngineError::Validation(msg)) => assert!(msg.contains("ghost")),
            other => panic!("expected validation error, got {:?}", other.map(|o| ids(&o))),
        }
        let nodes = vec![task("a", &[])];
        assert!(matches!(
            resolve_order(&nodes, &[conn("a", "ghost")]),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let nodes = vec![task("a", &[]), task("a", &[])];
        assert!(matches!(validate_graph(&nodes, &[]), Err(EngineError::Validation(_))));
    }

    #[test]
    fn checkpoint_filter_keeps_relative_order() {
        let nodes = vec![task("a", &[]), task("b", &["a"]), task("c", &["b"])];
        let order = resolve_order(&nodes, &[]).unwrap();
        let rows = vec![
            persisted("a", NodeStatus::Completed),
            persisted("b", NodeStatus::Failed),
        ];
        let remaining = pending_from_checkpoint(order, &rows);
        assert_eq!(ids(&remaining), vec!["b", "c"]);
    }
}

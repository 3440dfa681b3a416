//! Dependency graph construction and validation using petgraph.
//!
//! The graph is rebuilt from the definition at submit time and again on
//! resume, so tampered persisted state cannot smuggle in a cycle or a
//! dangling dependency.

use crate::definition::WorkflowDefinition;
use crate::error::ValidationError;
use millrace_core::NodeId;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// The dependency graph of a workflow definition.
///
/// Edges point from a dependency to its dependent, so downstream
/// traversal follows outgoing edges.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    /// Builds and validates the graph for a definition.
    ///
    /// # Errors
    ///
    /// Returns an error if node ids are duplicated, a dependency does not
    /// resolve, or the graph contains a cycle.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &definition.nodes {
            if index.contains_key(&node.id) {
                return Err(ValidationError::DuplicateNodeId {
                    node_id: node.id.clone(),
                });
            }
            let idx = graph.add_node(node.id.clone());
            index.insert(node.id.clone(), idx);
        }

        for node in &definition.nodes {
            let target = index[&node.id];
            for dependency in &node.dependencies {
                let Some(&source) = index.get(dependency) else {
                    return Err(ValidationError::UnknownDependency {
                        node_id: node.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                graph.add_edge(source, target, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(ValidationError::CycleDetected);
        }

        Ok(Self { graph, index })
    }

    /// Returns the direct dependents (downstream neighbours) of a node.
    #[must_use]
    pub fn dependents(&self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(&idx) = self.index.get(node_id) else {
            return Vec::new();
        };

        self.graph
            .edges_directed(idx, Direction::Outgoing)
            .filter_map(|edge| self.graph.node_weight(edge.target()))
            .cloned()
            .collect()
    }

    /// Returns all transitive dependents of a node, excluding the node
    /// itself.
    ///
    /// Used to cascade skips: when a node is skipped with dependent
    /// skipping enabled, every still-pending node in this closure is
    /// skipped too.
    #[must_use]
    pub fn dependent_closure(&self, node_id: &NodeId) -> Vec<NodeId> {
        let Some(&start) = self.index.get(node_id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut to_visit = vec![start];
        let mut closure = Vec::new();

        while let Some(idx) = to_visit.pop() {
            for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                let target = edge.target();
                if let Some(id) = self.graph.node_weight(target)
                    && seen.insert(id.clone())
                {
                    closure.push(id.clone());
                    to_visit.push(target);
                }
            }
        }

        closure
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

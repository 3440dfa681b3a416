//! Workflow definition types.
//!
//! A definition is the immutable input to the engine: metadata plus an
//! ordered sequence of nodes with declared dependencies, inputs, event
//! gates, and failure-handling policy. Definitions are serialised in the
//! on-disk workflow schema (camelCase keys); unknown fields round-trip
//! unchanged through the flattened `extra` maps.

use crate::manager::FailurePolicy;
use crate::retry::RetryConfig;
use millrace_core::{NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A single node in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique id within the workflow.
    pub id: NodeId,
    /// The node type, selecting the handler that executes it.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Inputs passed to the handler.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, JsonValue>,
    /// Nodes that must reach a satisfying terminal state first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<NodeId>,
    /// Event types that must be observed before this node becomes ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wait_for_events: Vec<String>,
    /// Upper bound on handler execution, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Per-node retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    /// Per-node failure-handling override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_handling: Option<FailurePolicy>,
    /// Unknown fields, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Node {
    /// Creates a node of the given type.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            inputs: Map::new(),
            dependencies: Vec::new(),
            wait_for_events: Vec::new(),
            timeout: None,
            retry_config: None,
            failure_handling: None,
            extra: Map::new(),
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an input value.
    #[must_use]
    pub fn with_input(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Declares a dependency on another node.
    #[must_use]
    pub fn depends_on(mut self, node_id: impl Into<NodeId>) -> Self {
        self.dependencies.push(node_id.into());
        self
    }

    /// Gates the node on an event type being observed.
    #[must_use]
    pub fn waits_for(mut self, event_type: impl Into<String>) -> Self {
        self.wait_for_events.push(event_type.into());
        self
    }

    /// Sets the per-node execution timeout in milliseconds.
    #[must_use]
    pub fn with_timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    /// Sets the failure-handling policy.
    #[must_use]
    pub fn with_failure_handling(mut self, policy: FailurePolicy) -> Self {
        self.failure_handling = Some(policy);
        self
    }
}

/// A complete workflow definition.
///
/// Definitions are never mutated after submission; the executor embeds a
/// copy in the persisted workflow state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Semantic version of the definition.
    #[serde(default = "default_version")]
    pub version: String,
    /// Description of what this workflow does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The nodes of the workflow, in authoring order.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Workflow-level failure-handling defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_handling: Option<FailurePolicy>,
    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, JsonValue>,
    /// Unknown fields, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl WorkflowDefinition {
    /// Creates an empty workflow definition.
    #[must_use]
    pub fn new(id: impl Into<WorkflowId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            nodes: Vec::new(),
            failure_handling: None,
            metadata: Map::new(),
            extra: Map::new(),
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Appends a node.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Sets workflow-level failure-handling defaults.
    #[must_use]
    pub fn with_failure_handling(mut self, policy: FailurePolicy) -> Self {
        self.failure_handling = Some(policy);
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }
}

//! Event type carried by the bus.

use chrono::{DateTime, Utc};
use millrace_core::{EventId, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single event observed by the engine.
///
/// Events are transient: they live in the bus's bounded history and, when
/// relevant to a workflow, in that workflow's persisted event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier for this event.
    pub id: EventId,
    /// The event type, used for subscription and gating.
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The node this event targets, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Arbitrary payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl Event {
    /// Creates a new event of the given type at the given instant.
    #[must_use]
    pub fn new(event_type: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: EventId::generate(),
            event_type: event_type.into(),
            timestamp,
            node_id: None,
            data: None,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }

    /// Targets the event at a specific node.
    #[must_use]
    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

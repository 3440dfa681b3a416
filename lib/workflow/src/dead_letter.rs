//! Dead-letter queue: parked nodes that exhausted their retries.

use crate::classify::FailureType;
use crate::definition::Node;
use chrono::{DateTime, Utc};
use millrace_core::{DeadLetterId, NodeId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_period() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

/// Dead-letter queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeadLetterConfig {
    /// Whether exhausted nodes are parked instead of failing the
    /// workflow.
    pub enabled: bool,
    /// How often a single item may be re-submitted.
    pub max_retries: u32,
    /// Retention for parked items, in milliseconds.
    pub retention_period: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_retries: default_max_retries(),
            retention_period: default_retention_period(),
        }
    }
}

/// A parked node awaiting explicit re-submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterItem {
    /// Unique id of this queue item.
    pub id: DeadLetterId,
    /// The workflow the node belongs to.
    pub workflow_id: WorkflowId,
    /// The parked node's id.
    pub node_id: NodeId,
    /// The node definition as submitted.
    pub original_node: Node,
    /// The error that exhausted the retries.
    pub error: String,
    /// Classification of that error.
    pub failure_type: FailureType,
    /// Attempts made before parking.
    pub attempts: u32,
    /// When the node was parked.
    pub timestamp: DateTime<Utc>,
    /// How often this item has been re-submitted.
    #[serde(default)]
    pub retry_count: u32,
    /// Whether another re-submission is allowed.
    #[serde(default)]
    pub can_retry: bool,
}

/// Per-workflow dead-letter queues.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    items: HashMap<WorkflowId, Vec<DeadLetterItem>>,
}

impl DeadLetterQueue {
    /// Creates an empty queue set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks an item.
    pub fn push(&mut self, item: DeadLetterItem) {
        self.items
            .entry(item.workflow_id.clone())
            .or_default()
            .push(item);
    }

    /// Returns the parked items for a workflow.
    #[must_use]
    pub fn items(&self, workflow_id: &WorkflowId) -> Vec<DeadLetterItem> {
        self.items.get(workflow_id).cloned().unwrap_or_default()
    }

    /// Removes and returns an item by id.
    ///
    /// A second call for the same id finds nothing.
    pub fn take(&mut self, workflow_id: &WorkflowId, item_id: DeadLetterId) -> Option<DeadLetterItem> {
        let items = self.items.get_mut(workflow_id)?;
        let position = items.iter().position(|i| i.id == item_id)?;
        Some(items.remove(position))
    }

    /// Replaces a workflow's queue, e.g. when hydrating persisted state.
    pub fn replace(&mut self, workflow_id: &WorkflowId, items: Vec<DeadLetterItem>) {
        if items.is_empty() {
            self.items.remove(workflow_id);
        } else {
            self.items.insert(workflow_id.clone(), items);
        }
    }

    /// Drops all items for a workflow.
    pub fn forget(&mut self, workflow_id: &WorkflowId) {
        self.items.remove(workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(workflow: &str, node: &str) -> DeadLetterItem {
        DeadLetterItem {
            id: DeadLetterId::generate(),
            workflow_id: WorkflowId::from(workflow),
            node_id: NodeId::from(node),
            original_node: Node::new(node, "data"),
            error: "network down".to_string(),
            failure_type: FailureType::Transient,
            attempts: 2,
            timestamp: Utc::now(),
            retry_count: 0,
            can_retry: true,
        }
    }

    #[test]
    fn push_and_list() {
        let mut queue = DeadLetterQueue::new();
        queue.push(item("wf", "a"));
        queue.push(item("wf", "b"));
        queue.push(item("other", "c"));

        assert_eq!(queue.items(&WorkflowId::from("wf")).len(), 2);
        assert_eq!(queue.items(&WorkflowId::from("other")).len(), 1);
        assert!(queue.items(&WorkflowId::from("none")).is_empty());
    }

    #[test]
    fn take_is_idempotent() {
        let mut queue = DeadLetterQueue::new();
        let parked = item("wf", "a");
        let id = parked.id;
        queue.push(parked);

        let workflow_id = WorkflowId::from("wf");
        assert!(queue.take(&workflow_id, id).is_some());
        // The item is gone; the second call reports not-found.
        assert!(queue.take(&workflow_id, id).is_none());
    }

    #[test]
    fn item_serde_wire_names() {
        let json = serde_json::to_value(item("wf", "a")).expect("serialize");
        assert!(json.get("workflowId").is_some());
        assert!(json.get("originalNode").is_some());
        assert!(json.get("canRetry").is_some());
        assert_eq!(json["failureType"], "TRANSIENT");
    }
}

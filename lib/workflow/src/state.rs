//! Runtime state of a workflow and its nodes.
//!
//! `WorkflowState` is the persisted unit: the embedded definition, one
//! `NodeState` per node, the caller-supplied context, a bounded log of
//! observed events, and the failure-manager sections (circuit breakers,
//! metrics, dead-letter queue) so a resume in a fresh process sees the
//! same failure history. Timestamps serialise as ISO-8601; unknown fields
//! round-trip through the flattened `extra` map.

use crate::breaker::CircuitBreaker;
use crate::classify::FailureType;
use crate::dead_letter::DeadLetterItem;
use crate::definition::WorkflowDefinition;
use crate::metrics::NodeFailureMetrics;
use chrono::{DateTime, Utc};
use millrace_core::{NodeId, WorkflowId};
use millrace_events::Event;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Cap on the per-workflow observed-event log.
pub const STATE_EVENT_LOG_LIMIT: usize = 256;

/// The lifecycle state of a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Waiting for dependencies (or a retry deadline).
    Pending,
    /// Handler currently executing.
    Running,
    /// Gated on events that have not been observed yet.
    Waiting,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Skipped; dependents treat this as satisfied.
    Skipped,
    /// Refused because the node's circuit is open.
    CircuitOpen,
    /// Parked in the dead-letter queue.
    DeadLettered,
}

impl NodeStatus {
    /// Whether this status is terminal within an execution session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::DeadLettered
        )
    }

    /// Whether dependents of a node in this status may proceed.
    #[must_use]
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// The lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Actively executing rounds.
    Running,
    /// Suspended until awaited events arrive.
    Waiting,
    /// All nodes terminal, none failed.
    Completed,
    /// At least one node failed at workflow-fatal severity, or progress
    /// became impossible.
    Failed,
}

impl WorkflowStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Mutable runtime state of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// The node this state belongs to.
    pub id: NodeId,
    /// Current status.
    pub status: NodeStatus,
    /// Attempts made in this execution session, monotonic.
    #[serde(default)]
    pub attempts: u32,
    /// Failures since the last success.
    #[serde(default)]
    pub consecutive_failures: u32,
    /// When the latest attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the node reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the node last failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Earliest instant the next attempt may run (retry backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Handler result on success (or substituted fallback).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    /// Error message on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Classification of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_type: Option<FailureType>,
    /// Event types still unsatisfied while waiting.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub waiting_for_events: Vec<String>,
    /// Whether the node was parked in the dead-letter queue.
    #[serde(default)]
    pub dead_lettered: bool,
    /// Whether the node crossed the poison-message threshold.
    #[serde(default)]
    pub is_poison_message: bool,
}

impl NodeState {
    /// Creates a pending node state.
    #[must_use]
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            status: NodeStatus::Pending,
            attempts: 0,
            consecutive_failures: 0,
            started_at: None,
            completed_at: None,
            last_failure_at: None,
            next_attempt_at: None,
            result: None,
            error: None,
            failure_type: None,
            waiting_for_events: Vec::new(),
            dead_lettered: false,
            is_poison_message: false,
        }
    }

    /// Transitions into `RUNNING` for a new attempt.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Running;
        self.started_at = Some(now);
        self.attempts += 1;
        self.next_attempt_at = None;
        self.waiting_for_events.clear();
    }

    /// Records a successful result.
    pub fn complete(&mut self, result: JsonValue, now: DateTime<Utc>) {
        self.status = NodeStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
        self.error = None;
        self.failure_type = None;
        self.consecutive_failures = 0;
    }

    /// Records a failure without deciding the terminal status yet.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        failure_type: FailureType,
        now: DateTime<Utc>,
    ) {
        self.error = Some(error.into());
        self.failure_type = Some(failure_type);
        self.last_failure_at = Some(now);
        self.consecutive_failures += 1;
        if failure_type == FailureType::Poison {
            self.is_poison_message = true;
        }
    }

    /// Schedules the node back to `PENDING` with a retry deadline.
    pub fn schedule_retry(&mut self, at: DateTime<Utc>) {
        self.status = NodeStatus::Pending;
        self.next_attempt_at = Some(at);
    }

    /// Marks the node terminally failed.
    pub fn fail(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Failed;
        self.completed_at = Some(now);
    }

    /// Marks the node skipped.
    pub fn skip(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(now);
    }

    /// Parks the node in the dead-letter queue.
    pub fn dead_letter(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::DeadLettered;
        self.dead_lettered = true;
        self.completed_at = Some(now);
    }

    /// Marks the node as gated on the given event types.
    pub fn wait_for(&mut self, unsatisfied: Vec<String>) {
        self.status = NodeStatus::Waiting;
        self.waiting_for_events = unsatisfied;
    }

    /// Marks the node as refused by an open circuit.
    pub fn circuit_open(&mut self) {
        self.status = NodeStatus::CircuitOpen;
    }

    /// Returns interrupted and failed nodes to `PENDING` on resume.
    ///
    /// `RUNNING` means a crash mid-round and `CIRCUIT_OPEN` is re-gated
    /// so a recovered circuit can probe. `FAILED` is terminal only within
    /// a session; a resume is a new session and grants a fresh attempt
    /// budget. Completed, skipped, and dead-lettered nodes stay put (the
    /// dead-letter queue replays explicitly).
    pub fn reset_for_resume(&mut self) {
        match self.status {
            NodeStatus::Running | NodeStatus::CircuitOpen => {
                self.status = NodeStatus::Pending;
            }
            NodeStatus::Failed => {
                self.status = NodeStatus::Pending;
                self.attempts = 0;
                self.consecutive_failures = 0;
                self.completed_at = None;
                self.next_attempt_at = None;
            }
            _ => {}
        }
    }

    /// Resets the node for a dead-letter replay.
    pub fn reset_for_replay(&mut self) {
        self.status = NodeStatus::Pending;
        self.attempts = 0;
        self.consecutive_failures = 0;
        self.completed_at = None;
        self.next_attempt_at = None;
        self.result = None;
        self.error = None;
        self.failure_type = None;
        self.dead_lettered = false;
        self.is_poison_message = false;
    }
}

/// The persisted state of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    /// The definition as submitted.
    pub definition: WorkflowDefinition,
    /// Current workflow status.
    pub status: WorkflowStatus,
    /// Per-node runtime state, one entry per definition node.
    pub nodes: HashMap<NodeId, NodeState>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Caller-supplied context, read-only to handlers.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, JsonValue>,
    /// Observed events relevant to this workflow, bounded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    /// Circuit breaker state per node.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub circuit_breakers: HashMap<NodeId, CircuitBreaker>,
    /// Failure metrics per node.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub failure_metrics: HashMap<NodeId, NodeFailureMetrics>,
    /// Parked dead-letter items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dead_letter_queue: Vec<DeadLetterItem>,
    /// Unknown fields, preserved on round-trip.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl WorkflowState {
    /// Initialises state for a fresh run: every node `PENDING`, zero
    /// attempts.
    #[must_use]
    pub fn new(
        definition: WorkflowDefinition,
        context: Map<String, JsonValue>,
        now: DateTime<Utc>,
    ) -> Self {
        let nodes = definition
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::new(n.id.clone())))
            .collect();

        Self {
            definition,
            status: WorkflowStatus::Running,
            nodes,
            started_at: now,
            completed_at: None,
            context,
            events: Vec::new(),
            circuit_breakers: HashMap::new(),
            failure_metrics: HashMap::new(),
            dead_letter_queue: Vec::new(),
            extra: Map::new(),
        }
    }

    /// The workflow's id.
    #[must_use]
    pub fn workflow_id(&self) -> &WorkflowId {
        &self.definition.id
    }

    /// Looks up a node's state.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    /// Looks up a node's state mutably.
    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut NodeState> {
        self.nodes.get_mut(id)
    }

    /// Whether every node is terminal.
    #[must_use]
    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }

    /// Whether any node failed.
    #[must_use]
    pub fn any_failed(&self) -> bool {
        self.nodes.values().any(|n| n.status == NodeStatus::Failed)
    }

    /// Whether any node is gated on events.
    #[must_use]
    pub fn any_waiting(&self) -> bool {
        self.nodes.values().any(|n| n.status == NodeStatus::Waiting)
    }

    /// Ids of nodes not yet terminal.
    #[must_use]
    pub fn non_terminal_nodes(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The error of the first failed node, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<String> {
        self.nodes
            .values()
            .find(|n| n.status == NodeStatus::Failed)
            .and_then(|n| n.error.clone())
    }

    /// Results of every completed node.
    #[must_use]
    pub fn completed_results(&self) -> HashMap<NodeId, JsonValue> {
        self.nodes
            .values()
            .filter(|n| n.status == NodeStatus::Completed)
            .filter_map(|n| n.result.clone().map(|r| (n.id.clone(), r)))
            .collect()
    }

    /// Appends an observed event, deduplicating by id and evicting the
    /// oldest beyond the cap.
    pub fn record_event(&mut self, event: Event) {
        if self.events.iter().any(|e| e.id == event.id) {
            return;
        }
        self.events.push(event);
        while self.events.len() > STATE_EVENT_LOG_LIMIT {
            self.events.remove(0);
        }
    }

    /// A compact summary for listings.
    #[must_use]
    pub fn summary(&self) -> WorkflowSummary {
        WorkflowSummary {
            id: self.definition.id.clone(),
            name: self.definition.name.clone(),
            status: self.status,
            node_count: self.nodes.len(),
            completed_nodes: self
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Completed)
                .count(),
            failed_nodes: self
                .nodes
                .values()
                .filter(|n| n.status == NodeStatus::Failed)
                .count(),
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// Summary information about a workflow run (for listings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    /// Workflow id.
    pub id: WorkflowId,
    /// Workflow name.
    pub name: String,
    /// Current status.
    pub status: WorkflowStatus,
    /// Total number of nodes.
    pub node_count: usize,
    /// Nodes that completed.
    pub completed_nodes: usize,
    /// Nodes that failed.
    pub failed_nodes: usize,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Node;

    fn state() -> WorkflowState {
        let definition = WorkflowDefinition::new("wf", "test")
            .with_node(Node::new("a", "data"))
            .with_node(Node::new("b", "data").depends_on("a"));
        WorkflowState::new(definition, Map::new(), Utc::now())
    }

    #[test]
    fn new_state_is_all_pending() {
        let state = state();
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.nodes.len(), 2);
        assert!(
            state
                .nodes
                .values()
                .all(|n| n.status == NodeStatus::Pending && n.attempts == 0)
        );
        assert!(!state.all_terminal());
    }

    #[test]
    fn node_lifecycle() {
        let now = Utc::now();
        let mut node = NodeState::new(NodeId::from("a"));

        node.begin_attempt(now);
        assert_eq!(node.status, NodeStatus::Running);
        assert_eq!(node.attempts, 1);
        assert_eq!(node.started_at, Some(now));

        node.complete(serde_json::json!({"ok": true}), now);
        assert_eq!(node.status, NodeStatus::Completed);
        assert_eq!(node.consecutive_failures, 0);
        assert!(node.status.is_terminal());
    }

    #[test]
    fn failure_then_retry_keeps_attempts_monotonic() {
        let now = Utc::now();
        let mut node = NodeState::new(NodeId::from("a"));

        node.begin_attempt(now);
        node.record_failure("timeout", FailureType::Transient, now);
        node.schedule_retry(now + chrono::Duration::milliseconds(10));

        assert_eq!(node.status, NodeStatus::Pending);
        assert_eq!(node.attempts, 1);
        assert_eq!(node.consecutive_failures, 1);
        assert!(node.next_attempt_at.is_some());

        node.begin_attempt(now);
        assert_eq!(node.attempts, 2);
        assert!(node.next_attempt_at.is_none());
    }

    #[test]
    fn poison_failure_sets_flag() {
        let now = Utc::now();
        let mut node = NodeState::new(NodeId::from("a"));
        node.record_failure("stuck", FailureType::Poison, now);
        assert!(node.is_poison_message);
    }

    #[test]
    fn terminal_statuses() {
        assert!(NodeStatus::Completed.is_terminal());
        assert!(NodeStatus::Failed.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(NodeStatus::DeadLettered.is_terminal());
        assert!(!NodeStatus::Pending.is_terminal());
        assert!(!NodeStatus::Waiting.is_terminal());
        assert!(!NodeStatus::CircuitOpen.is_terminal());

        assert!(NodeStatus::Skipped.satisfies_dependents());
        assert!(!NodeStatus::DeadLettered.satisfies_dependents());
        assert!(!NodeStatus::Failed.satisfies_dependents());
    }

    #[test]
    fn reset_for_resume_releases_interrupted_nodes() {
        let now = Utc::now();
        let mut running = NodeState::new(NodeId::from("a"));
        running.begin_attempt(now);
        running.reset_for_resume();
        assert_eq!(running.status, NodeStatus::Pending);

        let mut open = NodeState::new(NodeId::from("b"));
        open.circuit_open();
        open.reset_for_resume();
        assert_eq!(open.status, NodeStatus::Pending);

        let mut done = NodeState::new(NodeId::from("c"));
        done.complete(serde_json::json!(1), now);
        done.reset_for_resume();
        assert_eq!(done.status, NodeStatus::Completed);
    }

    #[test]
    fn reset_for_resume_grants_failed_nodes_a_fresh_budget() {
        let now = Utc::now();
        let mut node = NodeState::new(NodeId::from("a"));
        node.begin_attempt(now);
        node.record_failure("boom", FailureType::Transient, now);
        node.fail(now);

        node.reset_for_resume();
        assert_eq!(node.status, NodeStatus::Pending);
        assert_eq!(node.attempts, 0);
        assert_eq!(node.consecutive_failures, 0);

        let mut parked = NodeState::new(NodeId::from("b"));
        parked.dead_letter(now);
        parked.reset_for_resume();
        assert_eq!(parked.status, NodeStatus::DeadLettered);
    }

    #[test]
    fn state_serde_roundtrip_preserves_unknown_fields_and_timestamps() {
        let mut state = state();
        state
            .node_mut(&NodeId::from("a"))
            .unwrap()
            .begin_attempt(Utc::now());
        state
            .extra
            .insert("legacyField".to_string(), serde_json::json!("kept"));

        let json = serde_json::to_string(&state).expect("serialize");
        let parsed: WorkflowState = serde_json::from_str(&json).expect("deserialize");

        assert_eq!(state, parsed);
        assert_eq!(parsed.extra["legacyField"], serde_json::json!("kept"));

        // Timestamps are ISO-8601 strings on the wire
        let value: JsonValue = serde_json::from_str(&json).expect("parse");
        let started = value["startedAt"].as_str().expect("string timestamp");
        assert!(started.contains('T'));
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&NodeStatus::DeadLettered).expect("serialize"),
            "\"DEAD_LETTERED\""
        );
        assert_eq!(
            serde_json::to_string(&NodeStatus::CircuitOpen).expect("serialize"),
            "\"CIRCUIT_OPEN\""
        );
        assert_eq!(
            serde_json::to_string(&WorkflowStatus::Waiting).expect("serialize"),
            "\"WAITING\""
        );
    }

    #[test]
    fn event_log_is_bounded_and_deduplicated() {
        let mut state = state();
        let event = Event::new("user_ok", Utc::now());
        state.record_event(event.clone());
        state.record_event(event);
        assert_eq!(state.events.len(), 1);

        for _ in 0..(STATE_EVENT_LOG_LIMIT + 10) {
            state.record_event(Event::new("tick", Utc::now()));
        }
        assert_eq!(state.events.len(), STATE_EVENT_LOG_LIMIT);
    }

    #[test]
    fn summary_counts() {
        let mut state = state();
        let now = Utc::now();
        state
            .node_mut(&NodeId::from("a"))
            .unwrap()
            .complete(serde_json::json!(1), now);

        let summary = state.summary();
        assert_eq!(summary.node_count, 2);
        assert_eq!(summary.completed_nodes, 1);
        assert_eq!(summary.failed_nodes, 0);
    }
}

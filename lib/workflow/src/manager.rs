//! The failure manager.
//!
//! Owns three orthogonal concerns per `(workflow, node)` pair — circuit
//! state, failure metrics, and the dead-letter queue — plus a
//! process-level poison set. The executor consults it twice per node:
//! before dispatch (may this node run?) and after a failure (retry,
//! park, skip, substitute, or fail the workflow?).
//!
//! All of its per-workflow state is exported into the persisted
//! `WorkflowState` after every round and hydrated back on resume, so
//! failure history survives process restarts.

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::classify::{FailureClassifier, FailureType, KeywordClassifier};
use crate::dead_letter::{DeadLetterConfig, DeadLetterItem, DeadLetterQueue};
use crate::definition::{Node, WorkflowDefinition};
use crate::metrics::{MonitoringConfig, NodeFailureMetrics};
use crate::retry::RetryConfig;
use crate::state::WorkflowState;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use millrace_core::{Clock, DeadLetterId, NodeId, SystemClock, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn default_poison_message_threshold() -> u32 {
    10
}

fn default_continue_on_node_failure() -> bool {
    true
}

/// How node failures are handled once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    /// Any failure is terminal for the workflow; no retries.
    FailFast,
    /// Retry per policy; permanent failure aborts the workflow.
    RetryAndFail,
    /// Retry; on exhaustion park the node in the dead-letter queue.
    RetryAndDlq,
    /// Retry; on exhaustion mark the node skipped.
    RetryAndSkip,
    /// Retry behind a three-state circuit breaker.
    CircuitBreaker,
    /// Retry; on exhaustion substitute a fallback result or skip.
    GracefulDegradation,
}

/// Failure-handling policy attached to a node or workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePolicy {
    /// The strategy to apply.
    pub strategy: FailureStrategy,
    /// Per-node circuit breaker tuning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Per-node fallback result for graceful degradation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<JsonValue>,
}

impl FailurePolicy {
    /// Creates a policy with the given strategy.
    #[must_use]
    pub fn new(strategy: FailureStrategy) -> Self {
        Self {
            strategy,
            circuit_breaker: None,
            fallback: None,
        }
    }

    /// Sets circuit breaker tuning.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Sets the fallback result.
    #[must_use]
    pub fn with_fallback(mut self, value: JsonValue) -> Self {
        self.fallback = Some(value);
        self
    }
}

/// Graceful degradation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GracefulDegradationConfig {
    /// Fallback results keyed by node id.
    pub fallback_results: HashMap<NodeId, JsonValue>,
    /// Whether a node without a fallback is skipped rather than failing
    /// the workflow.
    pub continue_on_node_failure: bool,
    /// Whether skipping a node also skips its pending dependents.
    pub skip_dependent_nodes: bool,
}

impl Default for GracefulDegradationConfig {
    fn default() -> Self {
        Self {
            fallback_results: HashMap::new(),
            continue_on_node_failure: default_continue_on_node_failure(),
            skip_dependent_nodes: false,
        }
    }
}

/// Global failure-handling configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FailureConfig {
    /// Default strategy when neither node nor workflow set one.
    pub strategy: FailureStrategy,
    /// Default retry policy for nodes without their own.
    pub retry: RetryConfig,
    /// Default circuit breaker tuning.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Dead-letter queue settings.
    pub dead_letter: DeadLetterConfig,
    /// Periodic monitoring settings.
    pub monitoring: MonitoringConfig,
    /// Attempts at which a node becomes a poison message.
    pub poison_message_threshold: u32,
    /// Graceful degradation settings.
    pub graceful_degradation: GracefulDegradationConfig,
}

impl Default for FailureConfig {
    fn default() -> Self {
        Self {
            strategy: FailureStrategy::RetryAndFail,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            monitoring: MonitoringConfig::default(),
            poison_message_threshold: default_poison_message_threshold(),
            graceful_degradation: GracefulDegradationConfig::default(),
        }
    }
}

/// Alerts surfaced to the caller-supplied handler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAlert {
    /// A node's circuit breaker opened.
    CircuitOpen {
        workflow_id: WorkflowId,
        node_id: NodeId,
        failure_count: u32,
    },
    /// A node's failure rate crossed the monitoring threshold.
    HighFailureRate {
        workflow_id: WorkflowId,
        node_id: NodeId,
        failure_rate: f64,
        threshold: f64,
    },
    /// A node was parked in the dead-letter queue.
    DeadLettered {
        workflow_id: WorkflowId,
        node_id: NodeId,
        attempts: u32,
    },
}

/// Caller-supplied alert sink. A panicking handler is caught and logged.
pub type AlertHandler = Arc<dyn Fn(&FailureAlert) + Send + Sync>;

/// Whether a node may execute right now.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionGate {
    /// The node may run.
    Allow,
    /// The node's circuit is open.
    CircuitOpen {
        /// When the circuit next allows a probe.
        retry_at: Option<DateTime<Utc>>,
    },
    /// The node crossed the poison threshold.
    Poisoned,
}

/// What the engine should do after a node failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureAction {
    /// Schedule the node back to `PENDING` after the delay.
    Retry { delay: Duration },
    /// Fail the workflow.
    FailWorkflow,
    /// Park the node in the dead-letter queue; the workflow continues.
    DeadLetter,
    /// Skip the node, optionally cascading to pending dependents.
    Skip { cascade: bool },
    /// Substitute the fallback value; the node counts as completed.
    Fallback { value: JsonValue },
}

/// Classification plus decided action for one failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureVerdict {
    /// How the failure was classified.
    pub failure_type: FailureType,
    /// What the engine should do.
    pub action: FailureAction,
}

type PairKey = (WorkflowId, NodeId);

/// Central failure-handling state, shared by all workflows of an
/// executor.
pub struct FailureManager {
    config: FailureConfig,
    classifier: Box<dyn FailureClassifier>,
    clock: Arc<dyn Clock>,
    breakers: Mutex<HashMap<PairKey, CircuitBreaker>>,
    metrics: Mutex<HashMap<PairKey, NodeFailureMetrics>>,
    dead_letters: Mutex<DeadLetterQueue>,
    poisoned: Mutex<HashSet<PairKey>>,
    alert_handler: Option<AlertHandler>,
}

impl FailureManager {
    /// Creates a manager with the default classifier and system clock.
    #[must_use]
    pub fn new(config: FailureConfig) -> Self {
        Self {
            config,
            classifier: Box::new(KeywordClassifier),
            clock: Arc::new(SystemClock),
            breakers: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(DeadLetterQueue::new()),
            poisoned: Mutex::new(HashSet::new()),
            alert_handler: None,
        }
    }

    /// Overrides the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Overrides the failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Box<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Sets the alert handler.
    #[must_use]
    pub fn with_alert_handler(mut self, handler: AlertHandler) -> Self {
        self.alert_handler = Some(handler);
        self
    }

    /// The manager's configuration.
    #[must_use]
    pub fn config(&self) -> &FailureConfig {
        &self.config
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<PairKey, CircuitBreaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> MutexGuard<'_, HashMap<PairKey, NodeFailureMetrics>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_dead_letters(&self) -> MutexGuard<'_, DeadLetterQueue> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_poisoned(&self) -> MutexGuard<'_, HashSet<PairKey>> {
        self.poisoned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the effective strategy: node policy, then workflow
    /// policy, then the global default.
    #[must_use]
    pub fn resolve_strategy(&self, node: &Node, definition: &WorkflowDefinition) -> FailureStrategy {
        node.failure_handling
            .as_ref()
            .map(|p| p.strategy)
            .or_else(|| definition.failure_handling.as_ref().map(|p| p.strategy))
            .unwrap_or(self.config.strategy)
    }

    fn breaker_config(&self, node: &Node) -> CircuitBreakerConfig {
        node.failure_handling
            .as_ref()
            .and_then(|p| p.circuit_breaker.clone())
            .unwrap_or_else(|| self.config.circuit_breaker.clone())
    }

    fn retry_config<'a>(&'a self, node: &'a Node) -> &'a RetryConfig {
        node.retry_config.as_ref().unwrap_or(&self.config.retry)
    }

    /// Asks whether a node may execute right now.
    pub fn execution_gate(
        &self,
        workflow_id: &WorkflowId,
        node: &Node,
        definition: &WorkflowDefinition,
    ) -> ExecutionGate {
        let key = (workflow_id.clone(), node.id.clone());

        if self.lock_poisoned().contains(&key) {
            return ExecutionGate::Poisoned;
        }

        if self.resolve_strategy(node, definition) == FailureStrategy::CircuitBreaker {
            let now = self.clock.now();
            let mut breakers = self.lock_breakers();
            let breaker = breakers.entry(key).or_default();
            if !breaker.can_execute(now) {
                return ExecutionGate::CircuitOpen {
                    retry_at: breaker.next_attempt_at,
                };
            }
        }

        ExecutionGate::Allow
    }

    /// Records a successful execution.
    pub fn record_success(
        &self,
        workflow_id: &WorkflowId,
        node: &Node,
        definition: &WorkflowDefinition,
    ) {
        let now = self.clock.now();
        let key = (workflow_id.clone(), node.id.clone());

        self.lock_metrics()
            .entry(key.clone())
            .or_default()
            .record_success(now);

        if self.resolve_strategy(node, definition) == FailureStrategy::CircuitBreaker {
            let config = self.breaker_config(node);
            let mut breakers = self.lock_breakers();
            let breaker = breakers.entry(key).or_default();
            if breaker.record_success(&config) {
                tracing::info!(
                    workflow_id = %workflow_id,
                    node_id = %node.id,
                    "circuit closed after success streak"
                );
            }
        }
    }

    /// Records a failed execution and decides what to do next.
    ///
    /// `attempts` counts all attempts made, including the failing one.
    pub fn record_failure(
        &self,
        workflow_id: &WorkflowId,
        node: &Node,
        definition: &WorkflowDefinition,
        error: &str,
        attempts: u32,
    ) -> FailureVerdict {
        let now = self.clock.now();
        let strategy = self.resolve_strategy(node, definition);
        let key = (workflow_id.clone(), node.id.clone());
        let mut alerts = Vec::new();

        let poisoned = attempts >= self.config.poison_message_threshold;
        let failure_type = if poisoned {
            self.lock_poisoned().insert(key.clone());
            FailureType::Poison
        } else {
            self.classifier.classify(error)
        };

        {
            let mut metrics = self.lock_metrics();
            let entry = metrics.entry(key.clone()).or_default();
            entry.record_failure(failure_type, now);
            if poisoned {
                entry.poison_count += 1;
            }
        }

        if strategy == FailureStrategy::CircuitBreaker {
            let config = self.breaker_config(node);
            let opened = {
                let mut breakers = self.lock_breakers();
                breakers.entry(key.clone()).or_default().record_failure(&config, now)
            };
            if opened {
                let failure_count = self
                    .lock_breakers()
                    .get(&key)
                    .map_or(0, |b| b.failure_count);
                self.lock_metrics()
                    .entry(key.clone())
                    .or_default()
                    .circuit_open_count += 1;
                alerts.push(FailureAlert::CircuitOpen {
                    workflow_id: workflow_id.clone(),
                    node_id: node.id.clone(),
                    failure_count,
                });
            }
        }

        let retry_config = self.retry_config(node);
        let action = if !poisoned
            && strategy != FailureStrategy::FailFast
            && retry_config.should_retry(error, failure_type, attempts)
        {
            FailureAction::Retry {
                delay: retry_config.retry_delay(attempts),
            }
        } else {
            self.terminal_action(
                workflow_id,
                node,
                strategy,
                error,
                failure_type,
                attempts,
                now,
                &mut alerts,
            )
        };

        for alert in &alerts {
            self.emit_alert(alert);
        }

        FailureVerdict {
            failure_type,
            action,
        }
    }

    /// The verdict for a node gated out by the poison set.
    pub fn poison_verdict(
        &self,
        workflow_id: &WorkflowId,
        node: &Node,
        definition: &WorkflowDefinition,
        attempts: u32,
    ) -> FailureVerdict {
        let now = self.clock.now();
        let strategy = self.resolve_strategy(node, definition);
        let mut alerts = Vec::new();

        let action = self.terminal_action(
            workflow_id,
            node,
            strategy,
            "node is marked as a poison message",
            FailureType::Poison,
            attempts,
            now,
            &mut alerts,
        );

        for alert in &alerts {
            self.emit_alert(alert);
        }

        FailureVerdict {
            failure_type: FailureType::Poison,
            action,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn terminal_action(
        &self,
        workflow_id: &WorkflowId,
        node: &Node,
        strategy: FailureStrategy,
        error: &str,
        failure_type: FailureType,
        attempts: u32,
        now: DateTime<Utc>,
        alerts: &mut Vec<FailureAlert>,
    ) -> FailureAction {
        match strategy {
            FailureStrategy::FailFast
            | FailureStrategy::RetryAndFail
            | FailureStrategy::CircuitBreaker => FailureAction::FailWorkflow,
            FailureStrategy::RetryAndDlq => {
                if !self.config.dead_letter.enabled {
                    return FailureAction::FailWorkflow;
                }

                let key = (workflow_id.clone(), node.id.clone());
                let item = DeadLetterItem {
                    id: DeadLetterId::generate(),
                    workflow_id: workflow_id.clone(),
                    node_id: node.id.clone(),
                    original_node: node.clone(),
                    error: error.to_string(),
                    failure_type,
                    attempts,
                    timestamp: now,
                    retry_count: 0,
                    can_retry: self.config.dead_letter.max_retries > 0,
                };
                self.lock_dead_letters().push(item);
                self.lock_metrics().entry(key).or_default().dead_letter_count += 1;
                alerts.push(FailureAlert::DeadLettered {
                    workflow_id: workflow_id.clone(),
                    node_id: node.id.clone(),
                    attempts,
                });
                FailureAction::DeadLetter
            }
            FailureStrategy::RetryAndSkip => FailureAction::Skip { cascade: false },
            FailureStrategy::GracefulDegradation => {
                let degradation = &self.config.graceful_degradation;
                let fallback = node
                    .failure_handling
                    .as_ref()
                    .and_then(|p| p.fallback.clone())
                    .or_else(|| degradation.fallback_results.get(&node.id).cloned());

                match fallback {
                    Some(value) => FailureAction::Fallback { value },
                    None if degradation.continue_on_node_failure => FailureAction::Skip {
                        cascade: degradation.skip_dependent_nodes,
                    },
                    None => FailureAction::FailWorkflow,
                }
            }
        }
    }

    /// Removes a dead-letter item for re-submission.
    ///
    /// Bumps the item's retry count and clears the node's poison marker;
    /// the caller is expected to reset the node state and resume the
    /// workflow. Returns `None` when the item does not exist (including
    /// a repeated call for the same id).
    pub fn retry_dead_letter_item(
        &self,
        workflow_id: &WorkflowId,
        item_id: DeadLetterId,
    ) -> Option<DeadLetterItem> {
        let mut item = self.lock_dead_letters().take(workflow_id, item_id)?;
        item.retry_count += 1;
        item.can_retry = item.retry_count < self.config.dead_letter.max_retries;
        self.lock_poisoned()
            .remove(&(workflow_id.clone(), item.node_id.clone()));
        Some(item)
    }

    /// Metrics for all nodes of a workflow.
    #[must_use]
    pub fn metrics_for(&self, workflow_id: &WorkflowId) -> HashMap<NodeId, NodeFailureMetrics> {
        self.lock_metrics()
            .iter()
            .filter(|((wf, _), _)| wf == workflow_id)
            .map(|((_, node), m)| (node.clone(), m.clone()))
            .collect()
    }

    /// Parked dead-letter items for a workflow.
    #[must_use]
    pub fn dead_letter_items(&self, workflow_id: &WorkflowId) -> Vec<DeadLetterItem> {
        self.lock_dead_letters().items(workflow_id)
    }

    /// Loads failure state from a persisted workflow.
    pub fn hydrate_workflow(&self, state: &WorkflowState) {
        let workflow_id = state.workflow_id();

        {
            let mut breakers = self.lock_breakers();
            breakers.retain(|(wf, _), _| wf != workflow_id);
            for (node_id, breaker) in &state.circuit_breakers {
                breakers.insert((workflow_id.clone(), node_id.clone()), breaker.clone());
            }
        }
        {
            let mut metrics = self.lock_metrics();
            metrics.retain(|(wf, _), _| wf != workflow_id);
            for (node_id, m) in &state.failure_metrics {
                metrics.insert((workflow_id.clone(), node_id.clone()), m.clone());
            }
        }
        self.lock_dead_letters()
            .replace(workflow_id, state.dead_letter_queue.clone());
        {
            let mut poisoned = self.lock_poisoned();
            poisoned.retain(|(wf, _)| wf != workflow_id);
            for node in state.nodes.values() {
                if node.is_poison_message {
                    poisoned.insert((workflow_id.clone(), node.id.clone()));
                }
            }
        }
    }

    /// Writes this workflow's failure sections into its state for
    /// persistence.
    pub fn export_workflow(&self, state: &mut WorkflowState) {
        let workflow_id = state.workflow_id().clone();

        state.circuit_breakers = self
            .lock_breakers()
            .iter()
            .filter(|((wf, _), _)| wf == &workflow_id)
            .map(|((_, node), b)| (node.clone(), b.clone()))
            .collect();
        state.failure_metrics = self
            .lock_metrics()
            .iter()
            .filter(|((wf, _), _)| wf == &workflow_id)
            .map(|((_, node), m)| (node.clone(), m.clone()))
            .collect();
        state.dead_letter_queue = self.lock_dead_letters().items(&workflow_id);
    }

    /// Drops all state for a workflow, e.g. after deletion.
    pub fn forget_workflow(&self, workflow_id: &WorkflowId) {
        self.lock_breakers().retain(|(wf, _), _| wf != workflow_id);
        self.lock_metrics().retain(|(wf, _), _| wf != workflow_id);
        self.lock_dead_letters().forget(workflow_id);
        self.lock_poisoned().retain(|(wf, _)| wf != workflow_id);
    }

    /// One monitoring pass: raise high-failure-rate alerts and prune
    /// metrics beyond the retention period.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let monitoring = &self.config.monitoring;
        let retention = ChronoDuration::milliseconds(monitoring.retention_period as i64);
        let mut alerts = Vec::new();

        {
            let mut metrics = self.lock_metrics();
            metrics.retain(|_, m| m.updated_at.is_none_or(|t| now - t <= retention));

            if monitoring.alerting_enabled {
                for ((workflow_id, node_id), m) in metrics.iter() {
                    if m.total_executions > 0 && m.failure_rate() > monitoring.failure_rate_threshold
                    {
                        alerts.push(FailureAlert::HighFailureRate {
                            workflow_id: workflow_id.clone(),
                            node_id: node_id.clone(),
                            failure_rate: m.failure_rate(),
                            threshold: monitoring.failure_rate_threshold,
                        });
                    }
                }
            }
        }

        for alert in &alerts {
            self.emit_alert(alert);
        }
    }

    /// Spawns the periodic monitor when enabled.
    ///
    /// Must be called within a Tokio runtime.
    pub fn spawn_monitor(manager: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        if !manager.config.monitoring.enabled {
            return None;
        }

        let period = Duration::from_millis(manager.config.monitoring.metrics_collection_interval);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.sweep();
            }
        }))
    }

    fn emit_alert(&self, alert: &FailureAlert) {
        tracing::warn!(alert = ?alert, "failure alert");
        if let Some(handler) = &self.alert_handler
            && catch_unwind(AssertUnwindSafe(|| handler(alert))).is_err()
        {
            tracing::warn!("alert handler panicked; alert dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use millrace_core::ManualClock;

    fn definition_with(node: Node) -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "test").with_node(node)
    }

    fn manager() -> FailureManager {
        FailureManager::new(FailureConfig::default())
    }

    fn captured_alerts() -> (AlertHandler, Arc<Mutex<Vec<FailureAlert>>>) {
        let seen: Arc<Mutex<Vec<FailureAlert>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: AlertHandler = Arc::new(move |alert: &FailureAlert| {
            sink.lock().unwrap().push(alert.clone());
        });
        (handler, seen)
    }

    #[test]
    fn strategy_resolution_prefers_node_then_workflow_then_global() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let _ = workflow_id;

        let plain = Node::new("a", "data");
        let definition = definition_with(plain.clone());
        assert_eq!(
            manager.resolve_strategy(&plain, &definition),
            FailureStrategy::RetryAndFail
        );

        let definition = definition_with(plain.clone())
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndSkip));
        assert_eq!(
            manager.resolve_strategy(&plain, &definition),
            FailureStrategy::RetryAndSkip
        );

        let node = Node::new("a", "data")
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndDlq));
        let definition = definition_with(node.clone())
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndSkip));
        assert_eq!(
            manager.resolve_strategy(&node, &definition),
            FailureStrategy::RetryAndDlq
        );
    }

    #[test]
    fn transient_failure_under_default_strategy_retries() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data");
        let definition = definition_with(node.clone());

        let verdict =
            manager.record_failure(&workflow_id, &node, &definition, "connection reset", 1);

        assert_eq!(verdict.failure_type, FailureType::Transient);
        assert!(matches!(verdict.action, FailureAction::Retry { .. }));
    }

    #[test]
    fn exhausted_retries_fail_the_workflow() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data").with_retry_config(RetryConfig::with_max_attempts(2));
        let definition = definition_with(node.clone());

        let verdict = manager.record_failure(&workflow_id, &node, &definition, "network down", 2);
        assert_eq!(verdict.action, FailureAction::FailWorkflow);
    }

    #[test]
    fn fail_fast_never_retries() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_failure_handling(FailurePolicy::new(FailureStrategy::FailFast));
        let definition = definition_with(node.clone());

        let verdict =
            manager.record_failure(&workflow_id, &node, &definition, "connection reset", 1);
        assert_eq!(verdict.action, FailureAction::FailWorkflow);
    }

    #[test]
    fn dlq_strategy_parks_on_exhaustion() {
        let (handler, seen) = captured_alerts();
        let manager = FailureManager::new(FailureConfig::default()).with_alert_handler(handler);
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(2))
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndDlq));
        let definition = definition_with(node.clone());

        let verdict = manager.record_failure(&workflow_id, &node, &definition, "network down", 2);
        assert_eq!(verdict.action, FailureAction::DeadLetter);

        let items = manager.dead_letter_items(&workflow_id);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 2);
        assert!(items[0].can_retry);

        let alerts = seen.lock().unwrap();
        assert!(
            alerts
                .iter()
                .any(|a| matches!(a, FailureAlert::DeadLettered { .. }))
        );
    }

    #[test]
    fn dead_letter_replay_is_idempotent() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(1))
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndDlq));
        let definition = definition_with(node.clone());

        manager.record_failure(&workflow_id, &node, &definition, "network down", 1);
        let item_id = manager.dead_letter_items(&workflow_id)[0].id;

        let replayed = manager
            .retry_dead_letter_item(&workflow_id, item_id)
            .expect("item");
        assert_eq!(replayed.retry_count, 1);

        // The item is gone now
        assert!(manager.retry_dead_letter_item(&workflow_id, item_id).is_none());
        assert!(manager.dead_letter_items(&workflow_id).is_empty());
    }

    #[test]
    fn skip_strategy_continues_without_cascade() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(1))
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndSkip));
        let definition = definition_with(node.clone());

        let verdict = manager.record_failure(&workflow_id, &node, &definition, "boom", 1);
        assert_eq!(verdict.action, FailureAction::Skip { cascade: false });
    }

    #[test]
    fn graceful_degradation_prefers_node_fallback() {
        let mut config = FailureConfig::default();
        config
            .graceful_degradation
            .fallback_results
            .insert(NodeId::from("a"), serde_json::json!("global"));
        let manager = FailureManager::new(config);
        let workflow_id = WorkflowId::from("wf");

        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(1))
            .with_failure_handling(
                FailurePolicy::new(FailureStrategy::GracefulDegradation)
                    .with_fallback(serde_json::json!("node-level")),
            );
        let definition = definition_with(node.clone());

        let verdict = manager.record_failure(&workflow_id, &node, &definition, "boom", 1);
        assert_eq!(
            verdict.action,
            FailureAction::Fallback {
                value: serde_json::json!("node-level")
            }
        );
    }

    #[test]
    fn graceful_degradation_without_fallback_skips_with_cascade() {
        let mut config = FailureConfig::default();
        config.graceful_degradation.skip_dependent_nodes = true;
        let manager = FailureManager::new(config);
        let workflow_id = WorkflowId::from("wf");

        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(1))
            .with_failure_handling(FailurePolicy::new(FailureStrategy::GracefulDegradation));
        let definition = definition_with(node.clone());

        let verdict = manager.record_failure(&workflow_id, &node, &definition, "boom", 1);
        assert_eq!(verdict.action, FailureAction::Skip { cascade: true });
    }

    #[test]
    fn poison_threshold_blocks_subsequent_execution() {
        let mut config = FailureConfig::default();
        config.poison_message_threshold = 3;
        let manager = FailureManager::new(config);
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data");
        let definition = definition_with(node.clone());

        let verdict = manager.record_failure(&workflow_id, &node, &definition, "timeout", 3);
        assert_eq!(verdict.failure_type, FailureType::Poison);
        // Poison never retries, even though "timeout" is transient
        assert_eq!(verdict.action, FailureAction::FailWorkflow);

        assert_eq!(
            manager.execution_gate(&workflow_id, &node, &definition),
            ExecutionGate::Poisoned
        );
    }

    #[test]
    fn circuit_opens_and_recovers() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let (handler, seen) = captured_alerts();

        let mut config = FailureConfig::default();
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 3,
            time_window: 60_000,
            recovery_timeout: 50,
            success_threshold: 2,
        };
        // Retry bound below the breaker threshold keeps verdicts simple
        config.retry = RetryConfig::with_max_attempts(10);

        let manager = FailureManager::new(config)
            .with_clock(clock.clone())
            .with_alert_handler(handler);
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_failure_handling(FailurePolicy::new(FailureStrategy::CircuitBreaker));
        let definition = definition_with(node.clone());

        for attempt in 1..=3 {
            manager.record_failure(&workflow_id, &node, &definition, "connection reset", attempt);
        }

        // The circuit is open and gates execution
        assert!(matches!(
            manager.execution_gate(&workflow_id, &node, &definition),
            ExecutionGate::CircuitOpen { .. }
        ));
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .any(|a| matches!(a, FailureAlert::CircuitOpen { .. }))
        );

        // After the recovery timeout the probe is allowed
        clock.advance(ChronoDuration::milliseconds(60));
        assert_eq!(
            manager.execution_gate(&workflow_id, &node, &definition),
            ExecutionGate::Allow
        );

        // Two successes close the circuit
        manager.record_success(&workflow_id, &node, &definition);
        manager.record_success(&workflow_id, &node, &definition);
        assert_eq!(
            manager.execution_gate(&workflow_id, &node, &definition),
            ExecutionGate::Allow
        );
    }

    #[test]
    fn metrics_track_successes_and_failures() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data");
        let definition = definition_with(node.clone());

        manager.record_success(&workflow_id, &node, &definition);
        manager.record_failure(&workflow_id, &node, &definition, "connection reset", 1);

        let metrics = manager.metrics_for(&workflow_id);
        let m = &metrics[&NodeId::from("a")];
        assert_eq!(m.total_executions, 2);
        assert_eq!(m.total_failures, 1);
        assert_eq!(m.failure_rate(), 50.0);
        assert_eq!(m.failures_by_type[&FailureType::Transient], 1);
    }

    #[test]
    fn sweep_alerts_on_high_failure_rate_and_prunes_stale_metrics() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let (handler, seen) = captured_alerts();

        let mut config = FailureConfig::default();
        config.monitoring.enabled = true;
        config.monitoring.failure_rate_threshold = 50.0;
        config.monitoring.retention_period = 1000;

        let manager = FailureManager::new(config)
            .with_clock(clock.clone())
            .with_alert_handler(handler);
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data");
        let definition = definition_with(node.clone());

        manager.record_failure(&workflow_id, &node, &definition, "boom", 1);
        manager.sweep();

        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .any(|a| matches!(a, FailureAlert::HighFailureRate { .. }))
        );

        // Past the retention period the metrics are pruned
        clock.advance(ChronoDuration::milliseconds(5000));
        manager.sweep();
        assert!(manager.metrics_for(&workflow_id).is_empty());
    }

    #[test]
    fn panicking_alert_handler_is_contained() {
        let handler: AlertHandler = Arc::new(|_| panic!("handler exploded"));
        let manager = FailureManager::new(FailureConfig::default()).with_alert_handler(handler);
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(1))
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndDlq));
        let definition = definition_with(node.clone());

        // Does not unwind into the caller
        let verdict = manager.record_failure(&workflow_id, &node, &definition, "boom", 1);
        assert_eq!(verdict.action, FailureAction::DeadLetter);
    }

    #[test]
    fn hydrate_and_export_roundtrip() {
        use serde_json::Map;

        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(1))
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndDlq));
        let definition = definition_with(node.clone());

        manager.record_failure(&workflow_id, &node, &definition, "network down", 1);

        let mut state = WorkflowState::new(definition, Map::new(), Utc::now());
        manager.export_workflow(&mut state);
        assert_eq!(state.dead_letter_queue.len(), 1);
        assert!(state.failure_metrics.contains_key(&NodeId::from("a")));

        // A fresh manager hydrated from the state sees the same items
        let fresh = FailureManager::new(FailureConfig::default());
        fresh.hydrate_workflow(&state);
        assert_eq!(fresh.dead_letter_items(&workflow_id).len(), 1);
        assert_eq!(
            fresh.metrics_for(&workflow_id)[&NodeId::from("a")].total_failures,
            1
        );
    }

    #[test]
    fn forget_workflow_drops_all_sections() {
        let manager = manager();
        let workflow_id = WorkflowId::from("wf");
        let node = Node::new("a", "data")
            .with_retry_config(RetryConfig::with_max_attempts(1))
            .with_failure_handling(FailurePolicy::new(FailureStrategy::RetryAndDlq));
        let definition = definition_with(node.clone());

        manager.record_failure(&workflow_id, &node, &definition, "network down", 1);
        manager.forget_workflow(&workflow_id);

        assert!(manager.dead_letter_items(&workflow_id).is_empty());
        assert!(manager.metrics_for(&workflow_id).is_empty());
    }
}

//! The workflow executor: DAG scheduling, dispatch, and persistence.
//!
//! Execution proceeds in rounds:
//! 1. Re-evaluate event gates, then compute the ready set: `PENDING`
//!    nodes whose dependencies are satisfied and whose retry deadline
//!    has passed
//! 2. If nothing is ready: sleep until the earliest retry deadline, or
//!    suspend the workflow as `WAITING` when nodes are event-gated, or
//!    settle
//! 3. Dispatch the ready set concurrently, apply the outcomes, persist
//!
//! Persisted state after any round is a valid restart point; a resume
//! reloads it, re-validates the graph, and continues.

use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::handler::{HandlerContext, HandlerError, HandlerRegistry, NodeHandler};
use crate::manager::{ExecutionGate, FailureAction, FailureManager, FailureVerdict};
use crate::state::{NodeStatus, WorkflowState, WorkflowStatus};
use crate::storage::StateStore;
use crate::definition::{Node, WorkflowDefinition};
use crate::dead_letter::DeadLetterItem;
use crate::metrics::NodeFailureMetrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use millrace_core::{Clock, DeadLetterId, NodeId, WorkflowId};
use millrace_events::{Event, EventBus};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Outcome of one executor run (to completion, failure, or suspension).
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// The workflow that ran.
    pub workflow_id: WorkflowId,
    /// Terminal (or suspended) workflow status.
    pub status: WorkflowStatus,
    /// Wall-clock time from workflow start.
    pub duration: Duration,
    /// Results of every node that completed.
    pub node_results: HashMap<NodeId, JsonValue>,
    /// The failure that ended the run, if any.
    pub error: Option<String>,
    /// Failure metrics per node.
    pub failure_metrics: HashMap<NodeId, NodeFailureMetrics>,
    /// Dead-letter items parked during this and earlier runs.
    pub dead_letter_items: Vec<DeadLetterItem>,
}

struct Launch {
    node: Node,
    attempts: u32,
    handler: Option<Arc<dyn NodeHandler>>,
    ctx: HandlerContext,
    timeout: Option<Duration>,
}

async fn run_launch(launch: Launch) -> (Node, u32, Result<JsonValue, HandlerError>) {
    let Launch {
        node,
        attempts,
        handler,
        ctx,
        timeout,
    } = launch;

    let result = match handler {
        None => Err(HandlerError::UnsupportedNodeType {
            node_type: node.node_type.clone(),
        }),
        Some(handler) => match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, handler.execute(&node, &ctx, &node.inputs)).await
                {
                    Ok(result) => result,
                    // The handler may still produce a value after the
                    // deadline; it is discarded with the future.
                    Err(_) => Err(HandlerError::Timeout {
                        millis: limit.as_millis() as u64,
                    }),
                }
            }
            None => handler.execute(&node, &ctx, &node.inputs).await,
        },
    };

    (node, attempts, result)
}

/// Removes the workflow from the running set when a run ends.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<WorkflowId>>,
    id: WorkflowId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// The workflow executor.
///
/// One executor runs many workflows; each workflow state is exclusively
/// owned by the executor instance currently running it, enforced by a
/// process-local running set.
pub struct WorkflowExecutor {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) failures: Arc<FailureManager>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) running: Mutex<HashSet<WorkflowId>>,
    pub(crate) max_execution_time: Option<Duration>,
    pub(crate) validate_node_types: bool,
    pub(crate) monitor: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for WorkflowExecutor {
    fn drop(&mut self) {
        if let Some(monitor) = &self.monitor {
            monitor.abort();
        }
    }
}

impl WorkflowExecutor {
    /// Creates an executor with in-memory storage and default
    /// configuration. Useful for embedding and tests; production setups
    /// go through [`WorkflowExecutorBuilder`](crate::config::WorkflowExecutorBuilder).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(crate::storage::MemoryStateStore::new()),
            bus: Arc::new(EventBus::new()),
            failures: Arc::new(FailureManager::new(Default::default())),
            registry: HandlerRegistry::new(),
            clock: Arc::new(millrace_core::SystemClock),
            running: Mutex::new(HashSet::new()),
            max_execution_time: None,
            validate_node_types: false,
            monitor: None,
        }
    }

    /// The shared event bus.
    #[must_use]
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Emits an event onto the bus, stamped by the executor's clock.
    pub fn emit_event(
        &self,
        event_type: &str,
        data: Option<JsonValue>,
        node_id: Option<NodeId>,
    ) -> Event {
        let mut event = Event::new(event_type, self.clock.now());
        if let Some(data) = data {
            event = event.with_data(data);
        }
        if let Some(node_id) = node_id {
            event = event.with_node(node_id);
        }
        self.bus.emit(event.clone());
        event
    }

    /// Starts a new workflow run.
    ///
    /// # Errors
    ///
    /// Fails with a validation error for a malformed definition, a
    /// concurrency error when the workflow is already running, or a
    /// storage error; none of these persist partial state.
    pub async fn start_workflow(
        &self,
        definition: WorkflowDefinition,
        context: Option<Map<String, JsonValue>>,
    ) -> Result<ExecutionResult, EngineError> {
        let graph = DependencyGraph::build(&definition)?;
        if self.validate_node_types {
            for node in &definition.nodes {
                if !self.registry.contains(&node.node_type) {
                    return Err(crate::error::ValidationError::UnknownNodeType {
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                    }
                    .into());
                }
            }
        }

        let workflow_id = definition.id.clone();
        let _guard = self.claim(&workflow_id)?;

        if let Some(existing) = self.store.load(&workflow_id).await?
            && existing.status == WorkflowStatus::Running
        {
            return Err(EngineError::Concurrency { workflow_id });
        }

        tracing::info!(
            workflow_id = %workflow_id,
            nodes = definition.nodes.len(),
            "starting workflow"
        );

        let mut state =
            WorkflowState::new(definition, context.unwrap_or_default(), self.clock.now());
        self.persist(&state).await?;

        self.run_rounds(&mut state, &graph).await?;
        Ok(self.build_result(&state))
    }

    /// Resumes a persisted workflow.
    ///
    /// Interrupted (`RUNNING`), circuit-gated, and failed nodes return to
    /// `PENDING`; completed, skipped, and dead-lettered nodes keep their
    /// outcome.
    ///
    /// # Errors
    ///
    /// Fails when the workflow does not exist, already completed, is
    /// currently running, or its persisted definition no longer
    /// validates.
    pub async fn resume_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<ExecutionResult, EngineError> {
        let _guard = self.claim(workflow_id)?;

        let mut state = self
            .store
            .load(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                workflow_id: workflow_id.clone(),
            })?;

        if state.status == WorkflowStatus::Completed {
            return Err(EngineError::AlreadyCompleted {
                workflow_id: workflow_id.clone(),
            });
        }

        // Guards against tampered persisted definitions
        let graph = DependencyGraph::build(&state.definition)?;

        self.failures.hydrate_workflow(&state);
        for node in state.nodes.values_mut() {
            node.reset_for_resume();
        }
        state.status = WorkflowStatus::Running;
        state.completed_at = None;

        tracing::info!(workflow_id = %workflow_id, "resuming workflow");

        self.run_rounds(&mut state, &graph).await?;
        Ok(self.build_result(&state))
    }

    /// Loads the persisted state of a workflow.
    pub async fn get_workflow_state(
        &self,
        workflow_id: &WorkflowId,
    ) -> Result<Option<WorkflowState>, EngineError> {
        Ok(self.store.load(workflow_id).await?)
    }

    /// Deletes a workflow's persisted state and failure history.
    ///
    /// # Errors
    ///
    /// Fails when the workflow is currently running or does not exist.
    pub async fn delete_workflow(&self, workflow_id: &WorkflowId) -> Result<(), EngineError> {
        let _guard = self.claim(workflow_id)?;

        if self.store.load(workflow_id).await?.is_none() {
            return Err(EngineError::NotFound {
                workflow_id: workflow_id.clone(),
            });
        }

        self.store.delete(workflow_id).await?;
        self.failures.forget_workflow(workflow_id);
        Ok(())
    }

    /// Lists all persisted workflow ids.
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowId>, EngineError> {
        Ok(self.store.list().await?)
    }

    /// Failure metrics per node for a workflow.
    #[must_use]
    pub fn get_failure_metrics(
        &self,
        workflow_id: &WorkflowId,
    ) -> HashMap<NodeId, NodeFailureMetrics> {
        self.failures.metrics_for(workflow_id)
    }

    /// Parked dead-letter items for a workflow.
    #[must_use]
    pub fn get_dead_letter_queue(&self, workflow_id: &WorkflowId) -> Vec<DeadLetterItem> {
        self.failures.dead_letter_items(workflow_id)
    }

    /// Removes a dead-letter item and resets its node so a subsequent
    /// resume retries it.
    ///
    /// # Errors
    ///
    /// Fails when the item (or workflow) does not exist or the workflow
    /// is currently running. A repeated call for the same item id
    /// reports the item as not found.
    pub async fn retry_dead_letter_item(
        &self,
        workflow_id: &WorkflowId,
        item_id: DeadLetterId,
    ) -> Result<DeadLetterItem, EngineError> {
        let _guard = self.claim(workflow_id)?;

        let mut state = self
            .store
            .load(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                workflow_id: workflow_id.clone(),
            })?;

        self.failures.hydrate_workflow(&state);
        let item = self
            .failures
            .retry_dead_letter_item(workflow_id, item_id)
            .ok_or(EngineError::DeadLetterNotFound { item_id })?;

        if let Some(node) = state.nodes.get_mut(&item.node_id) {
            node.reset_for_replay();
        }
        // A completed workflow reopens so a resume is permitted again
        if state.status == WorkflowStatus::Completed {
            state.status = WorkflowStatus::Waiting;
            state.completed_at = None;
        }

        self.failures.export_workflow(&mut state);
        self.persist(&state).await?;

        tracing::info!(
            workflow_id = %workflow_id,
            node_id = %item.node_id,
            retry_count = item.retry_count,
            "dead-letter item re-submitted"
        );

        Ok(item)
    }

    fn claim(&self, workflow_id: &WorkflowId) -> Result<RunGuard<'_>, EngineError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(workflow_id.clone()) {
            return Err(EngineError::Concurrency {
                workflow_id: workflow_id.clone(),
            });
        }
        Ok(RunGuard {
            running: &self.running,
            id: workflow_id.clone(),
        })
    }

    async fn persist(&self, state: &WorkflowState) -> Result<(), EngineError> {
        self.store.save(state.workflow_id(), state).await?;
        Ok(())
    }

    async fn run_rounds(
        &self,
        state: &mut WorkflowState,
        graph: &DependencyGraph,
    ) -> Result<(), EngineError> {
        // Immutable during the run; cloning untangles it from node-state
        // mutation.
        let definition = state.definition.clone();
        let shared_context = Arc::new(state.context.clone());
        let workflow_id = definition.id.clone();

        loop {
            let now = self.clock.now();
            self.refresh_event_gates(state, &definition);

            let ready = self.ready_nodes(state, &definition, now);
            if ready.is_empty() {
                if let Some(at) = Self::earliest_retry(state, now) {
                    let wait = (at - now)
                        .to_std()
                        .unwrap_or_default()
                        .max(Duration::from_millis(1));
                    tokio::time::sleep(wait).await;
                    continue;
                }
                if state.any_waiting() {
                    state.status = WorkflowStatus::Waiting;
                    self.failures.export_workflow(state);
                    self.persist(state).await?;
                    tracing::info!(workflow_id = %workflow_id, "workflow waiting on events");
                    return Ok(());
                }
                break;
            }

            tracing::debug!(
                workflow_id = %workflow_id,
                round_size = ready.len(),
                "dispatching round"
            );

            let mut fatal: Option<String> = None;
            let mut launches = Vec::new();

            for node in ready {
                match self.failures.execution_gate(&workflow_id, &node, &definition) {
                    ExecutionGate::Allow => {
                        let ctx = HandlerContext {
                            workflow_id: workflow_id.clone(),
                            context: Arc::clone(&shared_context),
                            dependency_results: Self::dependency_results(state, &node),
                        };
                        let attempts = {
                            let Some(node_state) = state.node_mut(&node.id) else {
                                continue;
                            };
                            node_state.begin_attempt(now);
                            node_state.attempts
                        };
                        let timeout = node
                            .timeout
                            .map(Duration::from_millis)
                            .or(self.max_execution_time);
                        launches.push(Launch {
                            handler: self.registry.get(&node.node_type),
                            node,
                            attempts,
                            ctx,
                            timeout,
                        });
                    }
                    ExecutionGate::CircuitOpen { retry_at } => {
                        tracing::info!(
                            workflow_id = %workflow_id,
                            node_id = %node.id,
                            retry_at = ?retry_at,
                            "node refused: circuit open"
                        );
                        if let Some(node_state) = state.node_mut(&node.id) {
                            node_state.circuit_open();
                        }
                    }
                    ExecutionGate::Poisoned => {
                        let attempts = state.node(&node.id).map_or(0, |n| n.attempts);
                        let verdict = self.failures.poison_verdict(
                            &workflow_id,
                            &node,
                            &definition,
                            attempts,
                        );
                        self.apply_verdict(
                            state,
                            graph,
                            &node,
                            "node is marked as a poison message",
                            verdict,
                            &mut fatal,
                        );
                    }
                }
            }

            let outcomes = join_all(launches.into_iter().map(run_launch)).await;
            for (node, attempts, result) in outcomes {
                match result {
                    Ok(value) => {
                        self.failures.record_success(&workflow_id, &node, &definition);
                        let now = self.clock.now();
                        if let Some(node_state) = state.node_mut(&node.id) {
                            node_state.complete(value, now);
                        }
                        tracing::debug!(
                            workflow_id = %workflow_id,
                            node_id = %node.id,
                            attempts,
                            "node completed"
                        );
                    }
                    Err(error) => {
                        let message = error.to_string();
                        let verdict = self.failures.record_failure(
                            &workflow_id,
                            &node,
                            &definition,
                            &message,
                            attempts,
                        );
                        self.apply_verdict(state, graph, &node, &message, verdict, &mut fatal);
                    }
                }
            }

            if let Some(message) = fatal {
                state.status = WorkflowStatus::Failed;
                state.completed_at = Some(self.clock.now());
                self.failures.export_workflow(state);
                self.persist(state).await?;
                tracing::warn!(
                    workflow_id = %workflow_id,
                    error = %message,
                    "workflow failed"
                );
                return Ok(());
            }

            self.failures.export_workflow(state);
            self.persist(state).await?;
        }

        // Settlement: nothing ready, delayed, or waiting
        state.completed_at = Some(self.clock.now());
        if state.all_terminal() && !state.any_failed() {
            state.status = WorkflowStatus::Completed;
            tracing::info!(workflow_id = %workflow_id, "workflow completed");
        } else {
            state.status = WorkflowStatus::Failed;
            tracing::warn!(
                workflow_id = %workflow_id,
                blocked = ?state.non_terminal_nodes(),
                "workflow cannot make progress"
            );
        }
        self.failures.export_workflow(state);
        self.persist(state).await?;
        Ok(())
    }

    fn apply_verdict(
        &self,
        state: &mut WorkflowState,
        graph: &DependencyGraph,
        node: &Node,
        message: &str,
        verdict: FailureVerdict,
        fatal: &mut Option<String>,
    ) {
        let now = self.clock.now();
        let workflow_id = state.workflow_id().clone();
        let Some(node_state) = state.node_mut(&node.id) else {
            return;
        };
        node_state.record_failure(message, verdict.failure_type, now);

        match verdict.action {
            FailureAction::Retry { delay } => {
                let at = now
                    + ChronoDuration::from_std(delay)
                        .unwrap_or_else(|_| ChronoDuration::milliseconds(i64::MAX / 2));
                node_state.schedule_retry(at);
                tracing::debug!(
                    workflow_id = %workflow_id,
                    node_id = %node.id,
                    attempts = node_state.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "retry scheduled"
                );
            }
            FailureAction::FailWorkflow => {
                node_state.fail(now);
                if fatal.is_none() {
                    *fatal = Some(message.to_string());
                }
            }
            FailureAction::DeadLetter => {
                node_state.dead_letter(now);
                tracing::warn!(
                    workflow_id = %workflow_id,
                    node_id = %node.id,
                    error = %message,
                    "node dead-lettered"
                );
            }
            FailureAction::Skip { cascade } => {
                node_state.skip(now);
                tracing::info!(
                    workflow_id = %workflow_id,
                    node_id = %node.id,
                    cascade,
                    "node skipped after failure"
                );
                if cascade {
                    for dependent in graph.dependent_closure(&node.id) {
                        if let Some(dependent_state) = state.node_mut(&dependent)
                            && matches!(
                                dependent_state.status,
                                NodeStatus::Pending | NodeStatus::Waiting
                            )
                        {
                            dependent_state.skip(now);
                        }
                    }
                }
            }
            FailureAction::Fallback { value } => {
                node_state.complete(value, now);
                tracing::info!(
                    workflow_id = %workflow_id,
                    node_id = %node.id,
                    "fallback result substituted"
                );
            }
        }
    }

    /// Re-evaluates event gates for nodes whose dependencies are
    /// satisfied: unsatisfied gates park the node as `WAITING`, satisfied
    /// gates release it back to `PENDING`.
    ///
    /// The observation baseline is the node's last `started_at`, falling
    /// back to the workflow's start.
    fn refresh_event_gates(&self, state: &mut WorkflowState, definition: &WorkflowDefinition) {
        for node in &definition.nodes {
            if node.wait_for_events.is_empty() || !Self::deps_satisfied(state, node) {
                continue;
            }
            let Some(node_state) = state.node(&node.id) else {
                continue;
            };
            if !matches!(node_state.status, NodeStatus::Pending | NodeStatus::Waiting) {
                continue;
            }

            let baseline = node_state.started_at.unwrap_or(state.started_at);
            let mut observed = Vec::new();
            let mut unsatisfied = Vec::new();
            for event_type in &node.wait_for_events {
                match self.bus.has_event_occurred(event_type, None, Some(baseline)) {
                    Some(event) => observed.push(event),
                    None => unsatisfied.push(event_type.clone()),
                }
            }

            if unsatisfied.is_empty() {
                if let Some(node_state) = state.node_mut(&node.id) {
                    node_state.status = NodeStatus::Pending;
                    node_state.waiting_for_events.clear();
                }
                for event in observed {
                    state.record_event(event);
                }
            } else {
                tracing::debug!(
                    workflow_id = %state.workflow_id(),
                    node_id = %node.id,
                    awaiting = ?unsatisfied,
                    "node waiting on events"
                );
                if let Some(node_state) = state.node_mut(&node.id) {
                    node_state.wait_for(unsatisfied);
                }
            }
        }
    }

    fn deps_satisfied(state: &WorkflowState, node: &Node) -> bool {
        node.dependencies.iter().all(|dep| {
            state
                .node(dep)
                .is_some_and(|s| s.status.satisfies_dependents())
        })
    }

    fn ready_nodes(
        &self,
        state: &WorkflowState,
        definition: &WorkflowDefinition,
        now: DateTime<Utc>,
    ) -> Vec<Node> {
        definition
            .nodes
            .iter()
            .filter(|node| {
                state.node(&node.id).is_some_and(|s| {
                    s.status == NodeStatus::Pending
                        && s.next_attempt_at.is_none_or(|at| at <= now)
                        && Self::deps_satisfied(state, node)
                })
            })
            .cloned()
            .collect()
    }

    fn earliest_retry(state: &WorkflowState, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        state
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Pending)
            .filter_map(|n| n.next_attempt_at)
            .filter(|at| *at > now)
            .min()
    }

    fn dependency_results(state: &WorkflowState, node: &Node) -> Map<String, JsonValue> {
        let mut results = Map::new();
        for dep in &node.dependencies {
            if let Some(dep_state) = state.node(dep)
                && let Some(result) = &dep_state.result
            {
                results.insert(dep.as_str().to_string(), result.clone());
            }
        }
        results
    }

    fn build_result(&self, state: &WorkflowState) -> ExecutionResult {
        let workflow_id = state.workflow_id().clone();
        let finished = state.completed_at.unwrap_or_else(|| self.clock.now());
        let duration = (finished - state.started_at).to_std().unwrap_or_default();

        let error = if state.status == WorkflowStatus::Failed {
            state.first_failure().or_else(|| {
                Some(
                    EngineError::Stalled {
                        workflow_id: workflow_id.clone(),
                        nodes: state.non_terminal_nodes(),
                    }
                    .to_string(),
                )
            })
        } else {
            None
        };

        ExecutionResult {
            node_results: state.completed_results(),
            failure_metrics: self.failures.metrics_for(&workflow_id),
            dead_letter_items: self.failures.dead_letter_items(&workflow_id),
            status: state.status,
            duration,
            error,
            workflow_id,
        }
    }
}

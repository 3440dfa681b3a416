//! Node dispatch contract.
//!
//! The engine is polymorphic over a single operation: a ready node is
//! handed to the [`NodeHandler`] registered for its type. Operation
//! semantics live entirely outside the core; only two handlers are
//! permanently registered because the engine itself uses them: `data`
//! (pass-through) and `delay` (timer).

use crate::definition::Node;
use async_trait::async_trait;
use millrace_core::WorkflowId;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Node type of the built-in pass-through handler.
pub const DATA_NODE_TYPE: &str = "data";

/// Node type of the built-in timer handler.
pub const DELAY_NODE_TYPE: &str = "delay";

/// Errors a handler invocation can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Input validation failed.
    InvalidInput { message: String },
    /// The operation failed.
    Failed { message: String },
    /// No handler is registered for the node's type.
    UnsupportedNodeType { node_type: String },
    /// The handler exceeded its time budget; any late result is
    /// discarded.
    Timeout { millis: u64 },
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::Failed { message } => f.write_str(message),
            Self::UnsupportedNodeType { node_type } => {
                write!(f, "unsupported node type: {node_type}")
            }
            Self::Timeout { millis } => {
                write!(f, "node execution timed out after {millis} ms")
            }
        }
    }
}

impl std::error::Error for HandlerError {}

/// Read-only execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// Caller-supplied context from `start_workflow`; handlers must not
    /// rely on mutating it.
    pub context: Arc<Map<String, JsonValue>>,
    /// Results of this node's dependencies, keyed by node id.
    pub dependency_results: Map<String, JsonValue>,
}

/// Executes a node's operation.
///
/// Handlers must not mutate shared state; handlers for different nodes
/// may run concurrently.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Runs the operation for `node` and returns its result.
    async fn execute(
        &self,
        node: &Node,
        ctx: &HandlerContext,
        inputs: &Map<String, JsonValue>,
    ) -> Result<JsonValue, HandlerError>;
}

/// Built-in pass-through handler.
///
/// Returns the node's inputs as an object; a node without inputs passes
/// its dependency results through instead.
pub struct DataHandler;

#[async_trait]
impl NodeHandler for DataHandler {
    async fn execute(
        &self,
        _node: &Node,
        ctx: &HandlerContext,
        inputs: &Map<String, JsonValue>,
    ) -> Result<JsonValue, HandlerError> {
        if inputs.is_empty() {
            Ok(JsonValue::Object(ctx.dependency_results.clone()))
        } else {
            Ok(JsonValue::Object(inputs.clone()))
        }
    }
}

/// Built-in timer handler.
///
/// Sleeps for the `duration` input (milliseconds).
pub struct DelayHandler;

#[async_trait]
impl NodeHandler for DelayHandler {
    async fn execute(
        &self,
        _node: &Node,
        _ctx: &HandlerContext,
        inputs: &Map<String, JsonValue>,
    ) -> Result<JsonValue, HandlerError> {
        let millis = inputs
            .get("duration")
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| HandlerError::InvalidInput {
                message: "delay node requires a numeric 'duration' input (milliseconds)"
                    .to_string(),
            })?;

        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(serde_json::json!({ "delayed": millis }))
    }
}

/// Maps node type strings to handlers.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// Creates a registry with the permanently-registered `data` and
    /// `delay` handlers.
    #[must_use]
    pub fn new() -> Self {
        let mut handlers: HashMap<String, Arc<dyn NodeHandler>> = HashMap::new();
        handlers.insert(DATA_NODE_TYPE.to_string(), Arc::new(DataHandler));
        handlers.insert(DELAY_NODE_TYPE.to_string(), Arc::new(DelayHandler));
        Self { handlers }
    }

    /// Registers (or replaces) the handler for a node type.
    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    /// Returns the handler for a node type.
    #[must_use]
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    /// Whether a handler is registered for the type.
    #[must_use]
    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> HandlerContext {
        HandlerContext {
            workflow_id: WorkflowId::from("wf"),
            context: Arc::new(Map::new()),
            dependency_results: Map::new(),
        }
    }

    #[tokio::test]
    async fn data_handler_passes_inputs_through() {
        let node = Node::new("a", DATA_NODE_TYPE).with_input("x", serde_json::json!(1));
        let result = DataHandler
            .execute(&node, &context(), &node.inputs)
            .await
            .expect("execute");

        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn data_handler_falls_back_to_dependency_results() {
        let node = Node::new("b", DATA_NODE_TYPE);
        let mut ctx = context();
        ctx.dependency_results
            .insert("a".to_string(), serde_json::json!({"x": 1}));

        let result = DataHandler
            .execute(&node, &ctx, &node.inputs)
            .await
            .expect("execute");

        assert_eq!(result, serde_json::json!({"a": {"x": 1}}));
    }

    #[tokio::test]
    async fn delay_handler_requires_duration() {
        let node = Node::new("d", DELAY_NODE_TYPE);
        let err = DelayHandler
            .execute(&node, &context(), &node.inputs)
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn delay_handler_sleeps_then_reports() {
        let node = Node::new("d", DELAY_NODE_TYPE).with_input("duration", serde_json::json!(20));
        let started = std::time::Instant::now();
        let result = DelayHandler
            .execute(&node, &context(), &node.inputs)
            .await
            .expect("execute");

        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(result, serde_json::json!({"delayed": 20}));
    }

    #[test]
    fn registry_has_builtin_handlers() {
        let registry = HandlerRegistry::new();
        assert!(registry.contains(DATA_NODE_TYPE));
        assert!(registry.contains(DELAY_NODE_TYPE));
        assert!(!registry.contains("http"));
    }

    #[test]
    fn registry_registers_custom_handlers() {
        struct Custom;

        #[async_trait]
        impl NodeHandler for Custom {
            async fn execute(
                &self,
                _node: &Node,
                _ctx: &HandlerContext,
                _inputs: &Map<String, JsonValue>,
            ) -> Result<JsonValue, HandlerError> {
                Ok(JsonValue::Null)
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register("custom", Arc::new(Custom));
        assert!(registry.get("custom").is_some());
    }

    #[test]
    fn timeout_error_message_reads_as_transient() {
        let message = HandlerError::Timeout { millis: 5000 }.to_string();
        assert!(message.contains("timed out"));
    }
}

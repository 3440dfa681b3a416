//! Error types for the workflow crate.
//!
//! Layering mirrors the call structure:
//! - `ValidationError`: problems with a workflow definition itself
//! - `EngineError`: failures of executor operations (start, resume,
//!   delete, dead-letter replay), wrapping validation and storage errors
//!
//! Handler and storage failures have their own enums next to the traits
//! they belong to (`handler::HandlerError`, `storage::StorageError`).

use crate::storage::StorageError;
use millrace_core::{DeadLetterId, NodeId, WorkflowId};
use std::fmt;

/// Errors from validating a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Two nodes share the same id.
    DuplicateNodeId { node_id: NodeId },
    /// A declared dependency does not exist in the workflow.
    UnknownDependency {
        node_id: NodeId,
        dependency: NodeId,
    },
    /// The dependency graph contains a cycle.
    CycleDetected,
    /// A node's type has no registered handler (whitelisting mode).
    UnknownNodeType {
        node_id: NodeId,
        node_type: String,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id: {node_id}")
            }
            Self::UnknownDependency {
                node_id,
                dependency,
            } => {
                write!(
                    f,
                    "node {node_id} depends on unknown node {dependency}"
                )
            }
            Self::CycleDetected => write!(f, "dependency graph contains a cycle"),
            Self::UnknownNodeType { node_id, node_type } => {
                write!(
                    f,
                    "node {node_id} has type '{node_type}' with no registered handler"
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Errors from executor operations.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The workflow definition failed validation.
    Validation(ValidationError),
    /// The workflow is already running, locally or per persisted state.
    Concurrency { workflow_id: WorkflowId },
    /// No persisted state exists for the workflow.
    NotFound { workflow_id: WorkflowId },
    /// The workflow already ran to completion; it cannot be resumed.
    AlreadyCompleted { workflow_id: WorkflowId },
    /// A storage adapter operation failed.
    Storage(StorageError),
    /// No dead-letter item with the given id exists.
    DeadLetterNotFound { item_id: DeadLetterId },
    /// No node is ready or waiting, yet the workflow is not terminal.
    Stalled {
        workflow_id: WorkflowId,
        nodes: Vec<NodeId>,
    },
    /// Engine configuration could not be loaded or applied.
    Configuration { message: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "invalid workflow definition: {e}"),
            Self::Concurrency { workflow_id } => {
                write!(f, "workflow {workflow_id} is already running")
            }
            Self::NotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::AlreadyCompleted { workflow_id } => {
                write!(f, "workflow {workflow_id} already completed")
            }
            Self::Storage(e) => write!(f, "storage error: {e}"),
            Self::DeadLetterNotFound { item_id } => {
                write!(f, "dead-letter item not found: {item_id}")
            }
            Self::Stalled { workflow_id, nodes } => {
                let nodes: Vec<&str> = nodes.iter().map(NodeId::as_str).collect();
                write!(
                    f,
                    "workflow {workflow_id} stalled: nodes [{}] can no longer make progress",
                    nodes.join(", ")
                )
            }
            Self::Configuration { message } => {
                write!(f, "configuration error: {message}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e)
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

//! Storage adapter contract and the in-memory reference implementation.
//!
//! The executor persists once per scheduler round and treats any adapter
//! failure as fatal to the round; the workflow is left at its last
//! consistent persisted state. Adapters are not required to enforce
//! single-writer semantics; the executor's process-local running set
//! does.

use crate::state::WorkflowState;
use async_trait::async_trait;
use millrace_core::WorkflowId;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Errors from storage adapter operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Failed to persist state.
    SaveFailed { message: String },
    /// Failed to read state.
    LoadFailed { message: String },
    /// Failed to delete state.
    DeleteFailed { message: String },
    /// Failed to enumerate workflows.
    ListFailed { message: String },
    /// State could not be encoded or decoded.
    Serialization { message: String },
    /// The adapter could not be constructed.
    Configuration { message: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SaveFailed { message } => write!(f, "save failed: {message}"),
            Self::LoadFailed { message } => write!(f, "load failed: {message}"),
            Self::DeleteFailed { message } => write!(f, "delete failed: {message}"),
            Self::ListFailed { message } => write!(f, "list failed: {message}"),
            Self::Serialization { message } => write!(f, "serialization failed: {message}"),
            Self::Configuration { message } => {
                write!(f, "storage configuration invalid: {message}")
            }
        }
    }
}

impl std::error::Error for StorageError {}

/// Persistence contract for workflow state.
///
/// At most one writer per workflow id is assumed.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persists the state under the given id.
    async fn save(&self, id: &WorkflowId, state: &WorkflowState) -> Result<(), StorageError>;

    /// Loads the state for the given id, or `None` when absent.
    async fn load(&self, id: &WorkflowId) -> Result<Option<WorkflowState>, StorageError>;

    /// Deletes the state for the given id. Deleting an absent id is not
    /// an error.
    async fn delete(&self, id: &WorkflowId) -> Result<(), StorageError>;

    /// Lists all stored workflow ids.
    async fn list(&self) -> Result<Vec<WorkflowId>, StorageError>;
}

/// Process-local in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: Mutex<HashMap<WorkflowId, WorkflowState>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WorkflowId, WorkflowState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save(&self, id: &WorkflowId, state: &WorkflowState) -> Result<(), StorageError> {
        self.lock().insert(id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, id: &WorkflowId) -> Result<Option<WorkflowState>, StorageError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn delete(&self, id: &WorkflowId) -> Result<(), StorageError> {
        self.lock().remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<WorkflowId>, StorageError> {
        let mut ids: Vec<WorkflowId> = self.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

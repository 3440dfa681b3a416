//! File-backed state store.
//!
//! Each workflow is serialised as JSON under `<dir>/<prefix><id>.json`.
//! Writes land in a shadow file and are renamed into place, so a crash
//! mid-write never corrupts the previously persisted state. Timestamp
//! fields revive through chrono's serde implementations, driven by the
//! state schema itself.

use crate::state::WorkflowState;
use crate::storage::{StateStore, StorageError};
use async_trait::async_trait;
use millrace_core::WorkflowId;
use std::path::{Path, PathBuf};

/// Default filename prefix for stored workflows.
pub const DEFAULT_PREFIX: &str = "workflow_";

/// A state store keeping one JSON file per workflow.
#[derive(Debug, Clone)]
pub struct FsStateStore {
    dir: PathBuf,
    prefix: String,
}

impl FsStateStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Configuration {
            message: format!("cannot create state directory {}: {e}", dir.display()),
        })?;

        Ok(Self {
            dir,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// Overrides the filename prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn path_for(&self, id: &WorkflowId) -> PathBuf {
        self.dir.join(format!("{}{}.json", self.prefix, id))
    }

    fn shadow_path(path: &Path) -> PathBuf {
        let mut shadow = path.as_os_str().to_owned();
        shadow.push(".tmp");
        PathBuf::from(shadow)
    }
}

#[async_trait]
impl StateStore for FsStateStore {
    async fn save(&self, id: &WorkflowId, state: &WorkflowState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| StorageError::Serialization {
            message: e.to_string(),
        })?;

        let path = self.path_for(id);
        let shadow = Self::shadow_path(&path);

        tokio::fs::write(&shadow, &bytes)
            .await
            .map_err(|e| StorageError::SaveFailed {
                message: format!("writing {}: {e}", shadow.display()),
            })?;

        tokio::fs::rename(&shadow, &path)
            .await
            .map_err(|e| StorageError::SaveFailed {
                message: format!("renaming into {}: {e}", path.display()),
            })
    }

    async fn load(&self, id: &WorkflowId) -> Result<Option<WorkflowState>, StorageError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::LoadFailed {
                    message: format!("reading {}: {e}", path.display()),
                });
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Serialization {
                message: format!("decoding {}: {e}", path.display()),
            })
    }

    async fn delete(&self, id: &WorkflowId) -> Result<(), StorageError> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::DeleteFailed {
                message: format!("removing {}: {e}", path.display()),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowId>, StorageError> {
        let mut entries =
            tokio::fs::read_dir(&self.dir)
                .await
                .map_err(|e| StorageError::ListFailed {
                    message: format!("reading {}: {e}", self.dir.display()),
                })?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::ListFailed {
                message: e.to_string(),
            })?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json")
                && let Some(id) = stem.strip_prefix(&self.prefix)
            {
                ids.push(WorkflowId::from(id));
            }
        }

        ids.sort();
        Ok(ids)
    }
}

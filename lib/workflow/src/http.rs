//! Remote HTTP state store.
//!
//! Speaks the reference persistence surface:
//! - `GET    {base}/workflows`      → list of workflow ids
//! - `GET    {base}/workflows/{id}` → state JSON, or 404
//! - `PUT    {base}/workflows/{id}` → persist state JSON
//! - `DELETE {base}/workflows/{id}` → remove state
//!
//! A bearer token and custom headers are attached to every request;
//! network and non-2xx failures map to storage errors.

use crate::state::WorkflowState;
use crate::storage::{StateStore, StorageError};
use async_trait::async_trait;
use millrace_core::WorkflowId;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the remote HTTP store.
#[derive(Debug, Clone, Default)]
pub struct HttpStoreConfig {
    /// Base URL of the persistence service.
    pub base_url: String,
    /// Bearer token sent as `Authorization: Bearer <key>`.
    pub api_key: Option<String>,
    /// Extra headers merged into every request.
    pub headers: HashMap<String, String>,
    /// Per-request timeout in milliseconds.
    pub timeout: Option<u64>,
}

impl HttpStoreConfig {
    /// Creates a config pointing at the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Sets the bearer token.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Adds a custom header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the per-request timeout in milliseconds.
    #[must_use]
    pub fn with_timeout(mut self, millis: u64) -> Self {
        self.timeout = Some(millis);
        self
    }
}

/// State store backed by a remote HTTP service.
#[derive(Debug)]
pub struct HttpStateStore {
    client: reqwest::Client,
    config: HttpStoreConfig,
}

impl HttpStateStore {
    /// Builds the store and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured header is invalid or the client
    /// cannot be constructed.
    pub fn new(config: HttpStoreConfig) -> Result<Self, StorageError> {
        let mut headers = HeaderMap::new();

        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                StorageError::Configuration {
                    message: format!("invalid header name '{name}': {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| StorageError::Configuration {
                message: format!("invalid header value for '{name}': {e}"),
            })?;
            headers.insert(name, value);
        }

        if let Some(api_key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| {
                StorageError::Configuration {
                    message: format!("invalid api key: {e}"),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(millis) = config.timeout {
            builder = builder.timeout(Duration::from_millis(millis));
        }

        let client = builder.build().map_err(|e| StorageError::Configuration {
            message: e.to_string(),
        })?;

        Ok(Self { client, config })
    }

    fn collection_url(&self) -> String {
        format!("{}/workflows", self.config.base_url.trim_end_matches('/'))
    }

    fn workflow_url(&self, id: &WorkflowId) -> String {
        format!("{}/{}", self.collection_url(), id)
    }
}

#[async_trait]
impl StateStore for HttpStateStore {
    async fn save(&self, id: &WorkflowId, state: &WorkflowState) -> Result<(), StorageError> {
        let response = self
            .client
            .put(self.workflow_url(id))
            .json(state)
            .send()
            .await
            .map_err(|e| StorageError::SaveFailed {
                message: e.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StorageError::SaveFailed {
                message: format!("remote returned {}", response.status()),
            })
        }
    }

    async fn load(&self, id: &WorkflowId) -> Result<Option<WorkflowState>, StorageError> {
        let response = self
            .client
            .get(self.workflow_url(id))
            .send()
            .await
            .map_err(|e| StorageError::LoadFailed {
                message: e.to_string(),
            })?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StorageError::LoadFailed {
                message: format!("remote returned {}", response.status()),
            });
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| StorageError::Serialization {
                message: e.to_string(),
            })
    }

    async fn delete(&self, id: &WorkflowId) -> Result<(), StorageError> {
        let response = self
            .client
            .delete(self.workflow_url(id))
            .send()
            .await
            .map_err(|e| StorageError::DeleteFailed {
                message: e.to_string(),
            })?;

        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(StorageError::DeleteFailed {
                message: format!("remote returned {}", response.status()),
            })
        }
    }

    async fn list(&self) -> Result<Vec<WorkflowId>, StorageError> {
        let response = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .map_err(|e| StorageError::ListFailed {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(StorageError::ListFailed {
                message: format!("remote returned {}", response.status()),
            });
        }

        response
            .json()
            .await
            .map_err(|e| StorageError::Serialization {
                message: e.to_string(),
            })
    }
}

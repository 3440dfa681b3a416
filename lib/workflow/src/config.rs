//! Engine configuration and the executor factory.
//!
//! `EngineConfig` is a plain deserialisable struct; `from_env` loads it
//! through the `config` crate from `MILLRACE__`-prefixed environment
//! variables (e.g. `MILLRACE__STORAGE__TYPE=MEMORY`). The builder
//! assembles a [`WorkflowExecutor`] from a config plus any explicitly
//! supplied parts.

use crate::classify::FailureClassifier;
use crate::error::EngineError;
use crate::executor::WorkflowExecutor;
use crate::fs::FsStateStore;
use crate::handler::{HandlerRegistry, NodeHandler};
use crate::http::{HttpStateStore, HttpStoreConfig};
use crate::manager::{AlertHandler, FailureConfig, FailureManager};
use crate::storage::{MemoryStateStore, StateStore};
use millrace_core::{Clock, SystemClock};
use millrace_events::EventBus;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn default_log_level() -> String {
    "info".to_string()
}

/// Where workflow state is persisted.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// Process-local in-memory map.
    #[default]
    #[serde(rename = "MEMORY")]
    Memory,
    /// JSON files under a directory.
    #[serde(rename = "LOCAL")]
    Local {
        /// Directory holding the state files.
        path: PathBuf,
        /// Filename prefix; defaults to `workflow_`.
        #[serde(default)]
        prefix: Option<String>,
    },
    /// Remote HTTP persistence service.
    #[serde(rename = "REMOTE")]
    Remote {
        /// Base URL of the service.
        #[serde(alias = "baseUrl")]
        base_url: String,
        /// Bearer token.
        #[serde(default, alias = "apiKey")]
        api_key: Option<String>,
        /// Extra headers merged into every request.
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Per-request timeout in milliseconds.
        #[serde(default)]
        timeout: Option<u64>,
    },
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset
    /// (`debug`/`info`/`warn`/`error` or any filter directive).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Execution limits.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Global per-node timeout ceiling in milliseconds, applied to nodes
    /// without their own timeout.
    #[serde(alias = "maxExecutionTime")]
    pub max_execution_time: Option<u64>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Storage backend selection.
    pub storage: StorageConfig,
    /// Logging defaults.
    pub logging: LoggingConfig,
    /// Failure handling defaults.
    #[serde(alias = "failureHandling")]
    pub failure_handling: FailureConfig,
    /// Execution limits.
    pub security: SecurityConfig,
}

impl EngineConfig {
    /// Loads configuration from `MILLRACE__`-prefixed environment
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns an error when the environment cannot be deserialised into
    /// a valid configuration.
    pub fn from_env() -> Result<Self, EngineError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("MILLRACE").separator("__"))
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| EngineError::Configuration {
                message: e.to_string(),
            })
    }
}

/// Installs a global tracing subscriber honouring `RUST_LOG`, falling
/// back to the configured level.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.level.clone()));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Assembles a [`WorkflowExecutor`] from configuration and optional
/// explicit parts.
pub struct WorkflowExecutorBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn StateStore>>,
    bus: Option<Arc<EventBus>>,
    clock: Option<Arc<dyn Clock>>,
    registry: HandlerRegistry,
    classifier: Option<Box<dyn FailureClassifier>>,
    alert_handler: Option<AlertHandler>,
    validate_node_types: bool,
}

impl WorkflowExecutorBuilder {
    /// Starts from the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Starts from the given configuration.
    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            bus: None,
            clock: None,
            registry: HandlerRegistry::new(),
            classifier: None,
            alert_handler: None,
            validate_node_types: false,
        }
    }

    /// Supplies a storage adapter, overriding the configured one.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shares an existing event bus instead of creating one.
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Overrides the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Registers a handler for a node type.
    #[must_use]
    pub fn with_handler(
        mut self,
        node_type: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
    ) -> Self {
        self.registry.register(node_type, handler);
        self
    }

    /// Replaces the default failure classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: Box<dyn FailureClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Supplies the alert handler.
    #[must_use]
    pub fn with_alert_handler(mut self, handler: AlertHandler) -> Self {
        self.alert_handler = Some(handler);
        self
    }

    /// Rejects definitions containing node types without a registered
    /// handler at submit time.
    #[must_use]
    pub fn validate_node_types(mut self, enabled: bool) -> Self {
        self.validate_node_types = enabled;
        self
    }

    /// Builds the executor.
    ///
    /// Must be called within a Tokio runtime when monitoring is enabled,
    /// as the failure monitor is spawned here.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured storage adapter cannot be
    /// constructed.
    pub fn build(self) -> Result<WorkflowExecutor, EngineError> {
        let store: Arc<dyn StateStore> = match self.store {
            Some(store) => store,
            None => match &self.config.storage {
                StorageConfig::Memory => Arc::new(MemoryStateStore::new()),
                StorageConfig::Local { path, prefix } => {
                    let mut store = FsStateStore::new(path.clone())?;
                    if let Some(prefix) = prefix {
                        store = store.with_prefix(prefix.clone());
                    }
                    Arc::new(store)
                }
                StorageConfig::Remote {
                    base_url,
                    api_key,
                    headers,
                    timeout,
                } => {
                    let mut http = HttpStoreConfig::new(base_url.clone());
                    http.api_key = api_key.clone();
                    http.headers = headers.clone();
                    http.timeout = *timeout;
                    Arc::new(HttpStateStore::new(http)?)
                }
            },
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::new()));

        let mut manager = FailureManager::new(self.config.failure_handling.clone())
            .with_clock(Arc::clone(&clock));
        if let Some(classifier) = self.classifier {
            manager = manager.with_classifier(classifier);
        }
        if let Some(handler) = self.alert_handler {
            manager = manager.with_alert_handler(handler);
        }
        let failures = Arc::new(manager);
        let monitor = FailureManager::spawn_monitor(Arc::clone(&failures));

        Ok(WorkflowExecutor {
            store,
            bus,
            failures,
            registry: self.registry,
            clock,
            running: Mutex::new(HashSet::new()),
            max_execution_time: self.config.security.max_execution_time.map(Duration::from_millis),
            validate_node_types: self.validate_node_types,
            monitor,
        })
    }
}

impl Default for WorkflowExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

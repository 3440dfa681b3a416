//! Stateful DAG workflow execution for the millrace engine.
//!
//! This crate provides the runtime around a workflow definition:
//!
//! - **Definitions**: nodes with dependencies, inputs, event gates, and
//!   failure policy, serialised in the portable workflow schema
//! - **Scheduling**: round-based ready-set execution with concurrent
//!   dispatch, timeouts, and a persisted retry delay queue
//! - **Failure handling**: classification, retry with backoff, circuit
//!   breakers, a dead-letter queue, poison detection, metrics, alerts
//! - **Persistence**: a storage adapter contract with in-memory,
//!   filesystem, and remote HTTP implementations; state persists after
//!   every round and is a valid restart point
//! - **Dispatch contract**: a single `NodeHandler` trait plus a registry
//!   keyed by node type; operation semantics live with the embedder

pub mod breaker;
pub mod classify;
pub mod config;
pub mod dead_letter;
pub mod definition;
pub mod error;
pub mod executor;
pub mod fs;
pub mod graph;
pub mod handler;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod retry;
pub mod state;
pub mod storage;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classify::{FailureClassifier, FailureType, KeywordClassifier};
pub use config::{
    EngineConfig, LoggingConfig, SecurityConfig, StorageConfig, WorkflowExecutorBuilder,
    init_logging,
};
pub use dead_letter::{DeadLetterConfig, DeadLetterItem};
pub use definition::{Node, WorkflowDefinition};
pub use error::{EngineError, ValidationError};
pub use executor::{ExecutionResult, WorkflowExecutor};
pub use fs::FsStateStore;
pub use graph::DependencyGraph;
pub use handler::{
    DataHandler, DelayHandler, HandlerContext, HandlerError, HandlerRegistry, NodeHandler,
};
pub use http::{HttpStateStore, HttpStoreConfig};
pub use manager::{
    AlertHandler, ExecutionGate, FailureAction, FailureAlert, FailureConfig, FailureManager,
    FailurePolicy, FailureStrategy, FailureVerdict, GracefulDegradationConfig,
};
pub use metrics::{MonitoringConfig, NodeFailureMetrics};
pub use retry::RetryConfig;
pub use state::{NodeState, NodeStatus, WorkflowState, WorkflowStatus, WorkflowSummary};
pub use storage::{MemoryStateStore, StateStore, StorageError};

//! Per-node failure metrics and the monitoring configuration.

use crate::classify::FailureType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

fn default_metrics_collection_interval() -> u64 {
    60_000
}

fn default_failure_rate_threshold() -> f64 {
    50.0
}

fn default_alerting_enabled() -> bool {
    true
}

fn default_metrics_retention_period() -> u64 {
    60 * 60 * 1000
}

/// Configuration for the periodic failure monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    /// Whether the periodic monitor runs at all.
    pub enabled: bool,
    /// How often the monitor sweeps metrics, in milliseconds.
    pub metrics_collection_interval: u64,
    /// Failure-rate percentage above which an alert is raised.
    pub failure_rate_threshold: f64,
    /// Whether sweeps deliver alerts to the alert handler.
    pub alerting_enabled: bool,
    /// Metrics untouched for longer than this are pruned, in
    /// milliseconds.
    pub retention_period: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metrics_collection_interval: default_metrics_collection_interval(),
            failure_rate_threshold: default_failure_rate_threshold(),
            alerting_enabled: default_alerting_enabled(),
            retention_period: default_metrics_retention_period(),
        }
    }
}

/// Execution and failure counters for one `(workflow, node)` pair.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeFailureMetrics {
    /// Total executions, successes and failures combined.
    pub total_executions: u64,
    /// Total failed executions.
    pub total_failures: u64,
    /// Failure counts per classification.
    pub failures_by_type: HashMap<FailureType, u64>,
    /// How often the node's circuit breaker has opened.
    pub circuit_open_count: u64,
    /// How often the node was dead-lettered.
    pub dead_letter_count: u64,
    /// How often the node was flagged as a poison message.
    pub poison_count: u64,
    /// When the node last failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When these metrics were last touched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl NodeFailureMetrics {
    /// Records a successful execution.
    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.total_executions += 1;
        self.updated_at = Some(now);
    }

    /// Records a failed execution.
    pub fn record_failure(&mut self, failure_type: FailureType, now: DateTime<Utc>) {
        self.total_executions += 1;
        self.total_failures += 1;
        *self.failures_by_type.entry(failure_type).or_default() += 1;
        self.last_failure_at = Some(now);
        self.updated_at = Some(now);
    }

    /// Failure rate as a percentage of all executions.
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_executions as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_is_a_percentage() {
        let now = Utc::now();
        let mut metrics = NodeFailureMetrics::default();
        assert_eq!(metrics.failure_rate(), 0.0);

        metrics.record_success(now);
        metrics.record_failure(FailureType::Transient, now);
        metrics.record_failure(FailureType::Transient, now);
        metrics.record_success(now);

        assert_eq!(metrics.total_executions, 4);
        assert_eq!(metrics.total_failures, 2);
        assert_eq!(metrics.failure_rate(), 50.0);
        assert_eq!(metrics.failures_by_type[&FailureType::Transient], 2);
    }

    #[test]
    fn serde_keys_failures_by_wire_name() {
        let now = Utc::now();
        let mut metrics = NodeFailureMetrics::default();
        metrics.record_failure(FailureType::Dependency, now);

        let json = serde_json::to_value(&metrics).expect("serialize");
        assert_eq!(json["failuresByType"]["DEPENDENCY"], 1);
        assert!(json.get("totalExecutions").is_some());
    }
}

//! Three-state circuit breaker guarding a flaky node.
//!
//! State machine:
//! - `CLOSED`: failures accumulate (successes decrement, floor 0); at
//!   `failure_threshold` the breaker trips to `OPEN`
//! - `OPEN`: execution is refused until `next_attempt_at`, then the
//!   breaker moves to `HALF_OPEN`
//! - `HALF_OPEN`: the probe attempt runs; `success_threshold` consecutive
//!   successes close the breaker, any failure re-opens it
//!
//! Breakers are persisted inside the workflow state so a resume in a new
//! process honours an open circuit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

fn default_failure_threshold() -> u32 {
    5
}

fn default_time_window() -> u64 {
    60_000
}

fn default_recovery_timeout() -> u64 {
    30_000
}

fn default_success_threshold() -> u32 {
    2
}

/// Circuit breaker tuning, in milliseconds where durations apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive-ish failures required to open the circuit.
    pub failure_threshold: u32,
    /// Failures older than this window no longer count toward the
    /// threshold.
    pub time_window: u64,
    /// How long an open circuit refuses execution before probing.
    pub recovery_timeout: u64,
    /// Consecutive successes required to close a half-open circuit.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            time_window: default_time_window(),
            recovery_timeout: default_recovery_timeout(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// The state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast; execution refused.
    Open,
    /// Probing whether the underlying operation recovered.
    HalfOpen,
}

/// Breaker state for one `(workflow, node)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    /// Current circuit state.
    pub state: CircuitState,
    /// Failures counted toward the threshold.
    #[serde(default)]
    pub failure_count: u32,
    /// Consecutive successes while half-open.
    #[serde(default)]
    pub success_count: u32,
    /// When the last counted failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When an open circuit next allows a probe.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
        }
    }

    /// Whether execution is allowed right now.
    ///
    /// An open circuit past its recovery deadline transitions to
    /// half-open and allows the probe.
    pub fn can_execute(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.next_attempt_at.is_none_or(|at| now >= at) {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Records a successful execution.
    ///
    /// Returns true when this success closed a half-open circuit.
    pub fn record_success(&mut self, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_sub(1);
                false
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= config.success_threshold {
                    *self = Self::new();
                    true
                } else {
                    false
                }
            }
            CircuitState::Open => false,
        }
    }

    /// Records a failed execution.
    ///
    /// Returns true when this failure opened (or re-opened) the circuit.
    pub fn record_failure(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) -> bool {
        match self.state {
            CircuitState::HalfOpen => {
                self.last_failure_at = Some(now);
                self.trip(config, now);
                true
            }
            CircuitState::Open => {
                self.next_attempt_at =
                    Some(now + ChronoDuration::milliseconds(config.recovery_timeout as i64));
                false
            }
            CircuitState::Closed => {
                if let Some(last) = self.last_failure_at
                    && now - last > ChronoDuration::milliseconds(config.time_window as i64)
                {
                    // Stale failures outside the window no longer count
                    self.failure_count = 0;
                }
                self.failure_count += 1;
                self.last_failure_at = Some(now);

                if self.failure_count >= config.failure_threshold {
                    self.trip(config, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn trip(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.next_attempt_at =
            Some(now + ChronoDuration::milliseconds(config.recovery_timeout as i64));
    }
}

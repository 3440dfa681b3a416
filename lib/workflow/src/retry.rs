//! Retry policy: whether to retry and how long to back off.

use crate::classify::FailureType;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_attempts() -> u32 {
    3
}

fn default_delay() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    30_000
}

/// Retry policy for a node.
///
/// All durations are in milliseconds, matching the workflow schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub delay: u64,
    /// Multiplier applied per subsequent retry.
    pub backoff_multiplier: f64,
    /// Upper bound on the computed delay.
    pub max_delay: u64,
    /// Add uniform random jitter of ±25% to each delay.
    pub jitter: bool,
    /// Substrings marking an error as retryable. When non-empty, only
    /// matching errors retry.
    pub retryable_errors: Vec<String>,
    /// Substrings marking an error as never retryable. Takes precedence.
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
            jitter: false,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Creates a policy with the given attempt bound.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Sets the base delay in milliseconds.
    #[must_use]
    pub fn with_delay(mut self, millis: u64) -> Self {
        self.delay = millis;
        self
    }

    /// Enables jitter.
    #[must_use]
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Decides whether a failure may be retried.
    ///
    /// `attempts` is the number of attempts already made, including the
    /// one that just failed. A failure is retryable when the
    /// non-retryable list does not match, the retryable list matches (or,
    /// if empty, the classification is transient or dependency), and the
    /// attempt bound is not exhausted.
    #[must_use]
    pub fn should_retry(&self, error: &str, classification: FailureType, attempts: u32) -> bool {
        if attempts >= self.max_attempts {
            return false;
        }

        let message = error.to_lowercase();
        if self
            .non_retryable_errors
            .iter()
            .any(|m| message.contains(&m.to_lowercase()))
        {
            return false;
        }

        if !self.retryable_errors.is_empty() {
            return self
                .retryable_errors
                .iter()
                .any(|m| message.contains(&m.to_lowercase()));
        }

        matches!(
            classification,
            FailureType::Transient | FailureType::Dependency
        )
    }

    /// Computes the backoff before the next attempt, given `attempts`
    /// attempts already made.
    ///
    /// The delay is `delay × multiplier^(attempts − 1)` capped at
    /// `max_delay`, with ±25% uniform jitter when enabled, clamped at
    /// zero.
    #[must_use]
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let base = self.delay as f64 * self.backoff_multiplier.powi(exponent as i32);
        let capped = base.min(self.max_delay as f64);

        let millis = if self.jitter && capped > 0.0 {
            let spread = capped * 0.25;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(millis.round() as u64)
    }
}

//! Failure classification.
//!
//! The default classifier matches keywords in the error message. That is
//! deliberately crude: classification is a policy hook, and richer
//! classifiers (error-type based, downstream-status based) plug in behind
//! the same trait.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad categories of node failure, driving retry defaults and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Authentication or authorization failure.
    Security,
    /// Memory, disk, quota, or rate-limit exhaustion.
    Resource,
    /// Timeouts and network-level flakiness; retryable by default.
    Transient,
    /// An upstream service failed; retryable by default.
    Dependency,
    /// Validation and schema errors; retrying will not help.
    Permanent,
    /// The node crossed the poison-message threshold.
    Poison,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Security => "SECURITY",
            Self::Resource => "RESOURCE",
            Self::Transient => "TRANSIENT",
            Self::Dependency => "DEPENDENCY",
            Self::Permanent => "PERMANENT",
            Self::Poison => "POISON",
        };
        f.write_str(name)
    }
}

/// Maps an error message to a [`FailureType`].
pub trait FailureClassifier: Send + Sync {
    /// Classifies the given error message.
    fn classify(&self, error: &str) -> FailureType;
}

const SECURITY_KEYWORDS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "authentication",
    "permission",
    "access denied",
    "credential",
    "token expired",
];

const RESOURCE_KEYWORDS: &[&str] = &[
    "out of memory",
    "memory",
    "disk",
    "quota",
    "rate limit",
    "too many requests",
    "resource exhausted",
    "capacity",
];

// Checked before the transient keywords so "gateway timeout" lands on the
// upstream-failure side rather than the generic timeout side.
const DEPENDENCY_KEYWORDS: &[&str] = &[
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "upstream",
    "internal server error",
    "502",
    "503",
    "504",
];

const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "connection",
    "socket",
    "dns",
    "unreachable",
    "temporarily",
    "reset by peer",
];

const PERMANENT_KEYWORDS: &[&str] = &[
    "validation",
    "invalid",
    "schema",
    "malformed",
    "unsupported",
    "not supported",
    "parse error",
    "bad request",
];

/// The default keyword-based classifier.
///
/// Unmatched messages classify as [`FailureType::Transient`], erring on
/// the side of retryability.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn matches(message: &str, keywords: &[&str]) -> bool {
        keywords.iter().any(|k| message.contains(k))
    }
}

impl FailureClassifier for KeywordClassifier {
    fn classify(&self, error: &str) -> FailureType {
        let message = error.to_lowercase();

        if Self::matches(&message, SECURITY_KEYWORDS) {
            FailureType::Security
        } else if Self::matches(&message, RESOURCE_KEYWORDS) {
            FailureType::Resource
        } else if Self::matches(&message, DEPENDENCY_KEYWORDS) {
            FailureType::Dependency
        } else if Self::matches(&message, TRANSIENT_KEYWORDS) {
            FailureType::Transient
        } else if Self::matches(&message, PERMANENT_KEYWORDS) {
            FailureType::Permanent
        } else {
            FailureType::Transient
        }
    }
}

//! Strongly-typed identifier types for workflow entities.
//!
//! Two families of ids exist:
//!
//! - Author-chosen ids (`WorkflowId`, `NodeId`) are opaque strings taken
//!   verbatim from the workflow definition. Node ids are unique within a
//!   workflow, workflow ids within a storage namespace.
//! - Generated ids (`EventId`, `DeadLetterId`, `SubscriptionId`) wrap a
//!   ULID and render as `<prefix>_<ulid>`, so a bare id in a log line
//!   names its own type. Parsing is strict: the prefix is required, and
//!   a foreign prefix is rejected rather than silently accepted.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing a generated ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseIdError {
    /// The value did not start with the `<prefix>_` marker of the
    /// requested ID type.
    MissingPrefix {
        /// The ID type being parsed.
        id_type: &'static str,
        /// The marker that type requires.
        expected: &'static str,
    },
    /// The part after the marker was not a valid ULID.
    InvalidUlid {
        /// The ID type being parsed.
        id_type: &'static str,
        /// The underlying ULID parse failure.
        reason: String,
    },
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPrefix { id_type, expected } => {
                write!(f, "failed to parse {id_type}: expected '{expected}_' prefix")
            }
            Self::InvalidUlid { id_type, reason } => {
                write!(f, "failed to parse {id_type}: {reason}")
            }
        }
    }
}

impl std::error::Error for ParseIdError {}

/// Macro to generate an opaque string-keyed ID type.
///
/// These ids come from workflow definitions rather than being generated,
/// so any string is accepted verbatim.
macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an ID from the given string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the ID, returning the underlying string.
            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Macro to generate a prefixed, ULID-backed ID type.
///
/// The rendered form is `<prefix>_<ulid>`; `FromStr` demands exactly
/// that shape.
macro_rules! define_generated_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// The marker this ID type renders and parses with.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh, time-ordered ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub fn ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::generate()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s
                    .strip_prefix(Self::PREFIX)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .ok_or(ParseIdError::MissingPrefix {
                        id_type: stringify!($name),
                        expected: Self::PREFIX,
                    })?;

                Ulid::from_str(raw)
                    .map(Self)
                    .map_err(|e| ParseIdError::InvalidUlid {
                        id_type: stringify!($name),
                        reason: e.to_string(),
                    })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }

        impl From<$name> for Ulid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_key!(
    /// Unique identifier for a workflow, as written in its definition.
    WorkflowId
);

define_key!(
    /// Unique identifier for a node within a workflow definition.
    NodeId
);

define_generated_id!(
    /// Unique identifier for an event on the event bus.
    EventId,
    "evt"
);

define_generated_id!(
    /// Unique identifier for a dead-letter queue item.
    DeadLetterId,
    "dlq"
);

define_generated_id!(
    /// Unique identifier for an event bus subscription.
    SubscriptionId,
    "sub"
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn display_carries_the_type_marker() {
        assert!(EventId::generate().to_string().starts_with("evt_"));
        assert!(DeadLetterId::generate().to_string().starts_with("dlq_"));
        assert!(SubscriptionId::generate().to_string().starts_with("sub_"));
    }

    #[test]
    fn display_roundtrips_through_from_str() {
        let id = DeadLetterId::generate();
        let parsed: DeadLetterId = id.to_string().parse().expect("parse rendered form");
        assert_eq!(parsed, id);
        assert_eq!(parsed.ulid(), id.ulid());
    }

    #[test]
    fn bare_ulid_is_rejected_without_the_marker() {
        let bare = Ulid::new().to_string();
        let result: Result<EventId, _> = bare.parse();
        assert_eq!(
            result,
            Err(ParseIdError::MissingPrefix {
                id_type: "EventId",
                expected: "evt",
            })
        );
    }

    #[test]
    fn foreign_marker_is_rejected() {
        let event_id = EventId::generate().to_string();
        let result: Result<SubscriptionId, _> = event_id.parse();
        assert!(matches!(result, Err(ParseIdError::MissingPrefix { .. })));
    }

    #[test]
    fn garbage_after_the_marker_is_rejected() {
        let result: Result<EventId, _> = "evt_definitely-not-a-ulid".parse();
        match result {
            Err(ParseIdError::InvalidUlid { id_type, .. }) => assert_eq!(id_type, "EventId"),
            other => panic!("expected InvalidUlid, got {other:?}"),
        }
    }

    #[test]
    fn generated_ids_are_distinct() {
        let ids: HashSet<EventId> = (0..16).map(|_| EventId::generate()).collect();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn workflow_id_roundtrips_verbatim() {
        let id = WorkflowId::from("order-pipeline");
        assert_eq!(id.as_str(), "order-pipeline");
        assert_eq!(id.to_string(), "order-pipeline");
        assert_eq!(id.clone().into_string(), "order-pipeline");
    }

    #[test]
    fn node_id_serde_is_transparent() {
        let id = NodeId::from("n1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"n1\"");

        let parsed: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
    }

    #[test]
    fn node_ids_sort_lexicographically() {
        let mut ids = vec![NodeId::from("c"), NodeId::from("a"), NodeId::from("b")];
        ids.sort();
        assert_eq!(
            ids,
            vec![NodeId::from("a"), NodeId::from("b"), NodeId::from("c")]
        );
    }

    #[test]
    fn generated_id_serde_is_transparent() {
        let id = EventId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        let parsed: EventId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, parsed);
        // The wire form is the bare ULID, not the display form
        assert!(!json.contains("evt_"));
    }
}

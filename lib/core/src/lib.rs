//! Core types shared across the millrace workflow engine.
//!
//! This crate provides the foundational pieces the engine crates build on:
//!
//! - **Identifiers**: string-keyed ids for workflows and nodes (the ids a
//!   workflow author writes), and ULID-backed generated ids for events,
//!   dead-letter items, and bus subscriptions
//! - **Clock**: an injectable time source so every timestamp and deadline
//!   in the engine is deterministic under test

pub mod clock;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use id::{DeadLetterId, EventId, NodeId, ParseIdError, SubscriptionId, WorkflowId};

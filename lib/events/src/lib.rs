//! Event bus for the millrace workflow engine.
//!
//! This crate provides the coordination layer nodes use to wait on
//! external happenings:
//!
//! - **Events**: typed, timestamped payloads, optionally targeted at a
//!   node
//! - **Pub/sub**: synchronous fan-out to subscribers registered per event
//!   type
//! - **Waiters**: futures that resolve on the next matching event, with
//!   timeout and predicate support
//! - **History**: a bounded log of past events for "has this already
//!   happened" checks

pub mod bus;
pub mod event;

pub use bus::{EventBus, EventCallback, EventError, EventPredicate, DEFAULT_HISTORY_LIMIT};
pub use event::Event;

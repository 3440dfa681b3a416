//! Type-indexed publish/subscribe bus with bounded history and waiters.
//!
//! The bus is shared across workflows:
//! - `emit` is a synchronous fan-out; subscriber callbacks run on the
//!   emitter's thread, after the internal lock has been released
//! - a panicking subscriber is caught and logged, other subscribers are
//!   unaffected
//! - waiters registered via `wait_for_event` resolve on the next matching
//!   emission, or fail with a timeout error
//! - emissions are appended to a bounded history (oldest evicted) so
//!   gating logic can ask whether an event has already happened

use crate::event::Event;
use chrono::{DateTime, Utc};
use millrace_core::SubscriptionId;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Default number of events retained in the bus history.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// A subscriber callback, invoked synchronously for each matching event.
pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// A predicate narrowing which events satisfy a waiter or history query.
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Errors from event wait operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// No matching event arrived within the allowed time.
    Timeout {
        /// The event types that were awaited.
        event_types: Vec<String>,
        /// How long the waiter was willing to wait.
        waited: Duration,
    },
    /// The bus was dropped while a waiter was outstanding.
    BusClosed,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                event_types,
                waited,
            } => {
                write!(
                    f,
                    "timed out after {waited:?} waiting for event of type [{}]",
                    event_types.join(", ")
                )
            }
            Self::BusClosed => write!(f, "event bus closed while waiting"),
        }
    }
}

impl std::error::Error for EventError {}

struct Subscriber {
    id: SubscriptionId,
    callback: EventCallback,
}

struct Waiter {
    id: SubscriptionId,
    event_types: Vec<String>,
    predicate: Option<EventPredicate>,
    sender: oneshot::Sender<Event>,
}

impl Waiter {
    fn matches(&self, event: &Event) -> bool {
        self.event_types.iter().any(|t| t == &event.event_type)
            && self.predicate.as_ref().is_none_or(|p| p(event))
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<String, Vec<Subscriber>>,
    waiters: Vec<Waiter>,
    history: VecDeque<Event>,
}

/// The event bus.
pub struct EventBus {
    inner: Mutex<BusInner>,
    history_limit: usize,
}

impl EventBus {
    /// Creates a bus with the default history limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Creates a bus retaining at most `limit` historical events.
    #[must_use]
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            history_limit: limit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a callback for events of the given type.
    ///
    /// Returns a subscription id usable with [`EventBus::off`].
    pub fn on(&self, event_type: impl Into<String>, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId::generate();
        let mut inner = self.lock();
        inner
            .subscribers
            .entry(event_type.into())
            .or_default()
            .push(Subscriber { id, callback });
        id
    }

    /// Removes a subscription.
    ///
    /// Returns true if the subscription existed.
    pub fn off(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let Some(subscribers) = inner.subscribers.get_mut(event_type) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        before != subscribers.len()
    }

    /// Returns the number of subscribers for an event type.
    #[must_use]
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.lock()
            .subscribers
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Emits an event: appends it to history, fans out to subscribers of
    /// its type, and satisfies any matching waiters.
    ///
    /// Subscriber callbacks run on the caller's thread after the bus lock
    /// has been released; callers must not hold locks those callbacks
    /// need.
    pub fn emit(&self, event: Event) {
        let (callbacks, satisfied) = {
            let mut inner = self.lock();

            inner.history.push_back(event.clone());
            while inner.history.len() > self.history_limit {
                inner.history.pop_front();
            }

            let callbacks: Vec<EventCallback> = inner
                .subscribers
                .get(&event.event_type)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default();

            let waiters = std::mem::take(&mut inner.waiters);
            let (satisfied, kept): (Vec<Waiter>, Vec<Waiter>) =
                waiters.into_iter().partition(|w| w.matches(&event));
            inner.waiters = kept;

            (callbacks, satisfied)
        };

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                tracing::warn!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "event subscriber panicked; continuing fan-out"
                );
            }
        }

        for waiter in satisfied {
            // A waiter whose receiver has gone away is simply dropped.
            let _ = waiter.sender.send(event.clone());
        }
    }

    /// Waits for the next event of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Timeout`] if `timeout` elapses first.
    pub async fn wait_for_event(
        &self,
        event_type: &str,
        timeout: Option<Duration>,
        predicate: Option<EventPredicate>,
    ) -> Result<Event, EventError> {
        self.wait_for_any_event(&[event_type], timeout, predicate)
            .await
    }

    /// Waits for the next event matching any of the given types.
    ///
    /// The first match wins and the registration is removed; no other
    /// listed type can resolve the same waiter twice.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Timeout`] if `timeout` elapses first.
    pub async fn wait_for_any_event(
        &self,
        event_types: &[&str],
        timeout: Option<Duration>,
        predicate: Option<EventPredicate>,
    ) -> Result<Event, EventError> {
        let (sender, receiver) = oneshot::channel();
        let id = SubscriptionId::generate();
        let types: Vec<String> = event_types.iter().map(|t| (*t).to_string()).collect();

        {
            let mut inner = self.lock();
            inner.waiters.push(Waiter {
                id,
                event_types: types.clone(),
                predicate,
                sender,
            });
        }

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(EventError::BusClosed),
                Err(_) => {
                    self.remove_waiter(id);
                    Err(EventError::Timeout {
                        event_types: types,
                        waited: limit,
                    })
                }
            },
            None => receiver.await.map_err(|_| EventError::BusClosed),
        }
    }

    fn remove_waiter(&self, id: SubscriptionId) {
        self.lock().waiters.retain(|w| w.id != id);
    }

    /// Returns the most recent historical event of the given type, if any.
    #[must_use]
    pub fn has_event_occurred(
        &self,
        event_type: &str,
        predicate: Option<&EventPredicate>,
        since: Option<DateTime<Utc>>,
    ) -> Option<Event> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .rev()
            .find(|e| {
                e.event_type == event_type
                    && since.is_none_or(|s| e.timestamp >= s)
                    && predicate.is_none_or(|p| p(e))
            })
            .cloned()
    }

    /// Returns historical events, optionally filtered by type and time
    /// window, in emission order.
    #[must_use]
    pub fn get_event_history(
        &self,
        event_type: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<Event> {
        let inner = self.lock();
        inner
            .history
            .iter()
            .filter(|e| {
                event_type.is_none_or(|t| e.event_type == t)
                    && since.is_none_or(|s| e.timestamp >= s)
                    && until.is_none_or(|u| e.timestamp <= u)
            })
            .cloned()
            .collect()
    }

    /// Discards all historical events.
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(event_type: &str) -> Event {
        Event::new(event_type, Utc::now())
    }

    #[test]
    fn subscribers_receive_matching_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        bus.on(
            "tick",
            Arc::new(move |e: &Event| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push(e.data.clone().unwrap_or_default());
            }),
        );

        bus.emit(event("tick").with_data(serde_json::json!(1)));
        bus.emit(event("tock").with_data(serde_json::json!(99)));
        bus.emit(event("tick").with_data(serde_json::json!(2)));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn off_removes_subscription() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let id = bus.on(
            "tick",
            Arc::new(move |_: &Event| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(event("tick"));
        assert!(bus.off("tick", id));
        bus.emit(event("tick"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Second removal reports the subscription is gone
        assert!(!bus.off("tick", id));
    }

    #[test]
    fn panicking_subscriber_does_not_affect_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(
            "tick",
            Arc::new(|_: &Event| {
                panic!("subscriber exploded");
            }),
        );
        let count_clone = Arc::clone(&count);
        bus.on(
            "tick",
            Arc::new(move |_: &Event| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(event("tick"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn history_evicts_oldest_beyond_limit() {
        let bus = EventBus::with_history_limit(3);
        for i in 0..5 {
            bus.emit(event("tick").with_data(serde_json::json!(i)));
        }

        let history = bus.get_event_history(None, None, None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].data, Some(serde_json::json!(2)));
        assert_eq!(history[2].data, Some(serde_json::json!(4)));
    }

    #[test]
    fn has_event_occurred_respects_since_and_predicate() {
        let bus = EventBus::new();
        let early = Utc::now() - ChronoDuration::seconds(60);

        bus.emit(Event::new("approval", early).with_data(serde_json::json!({"by": "alice"})));
        bus.emit(event("approval").with_data(serde_json::json!({"by": "bob"})));

        // Most recent match wins
        let found = bus.has_event_occurred("approval", None, None).unwrap();
        assert_eq!(found.data, Some(serde_json::json!({"by": "bob"})));

        // Cutoff excludes the early event
        let cutoff = Utc::now() - ChronoDuration::seconds(30);
        let predicate: EventPredicate =
            Arc::new(|e: &Event| e.data.as_ref().is_some_and(|d| d["by"] == "alice"));
        assert!(
            bus.has_event_occurred("approval", Some(&predicate), Some(cutoff))
                .is_none()
        );

        assert!(bus.has_event_occurred("missing", None, None).is_none());
    }

    #[test]
    fn clear_history_empties_the_log() {
        let bus = EventBus::new();
        bus.emit(event("tick"));
        bus.clear_history();
        assert!(bus.get_event_history(None, None, None).is_empty());
    }

    #[tokio::test]
    async fn wait_for_event_resolves_on_emission() {
        let bus = Arc::new(EventBus::new());

        let bus_clone = Arc::clone(&bus);
        let waiter = tokio::spawn(async move {
            bus_clone
                .wait_for_event("user_ok", Some(Duration::from_secs(5)), None)
                .await
        });

        // Give the waiter a moment to register
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit(event("user_ok").with_data(serde_json::json!("approved")));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.event_type, "user_ok");
        assert_eq!(result.data, Some(serde_json::json!("approved")));
    }

    #[tokio::test]
    async fn wait_for_event_times_out() {
        let bus = EventBus::new();
        let result = bus
            .wait_for_event("never", Some(Duration::from_millis(30)), None)
            .await;

        match result {
            Err(EventError::Timeout { event_types, .. }) => {
                assert_eq!(event_types, vec!["never".to_string()]);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_for_event_predicate_skips_non_matching() {
        let bus = Arc::new(EventBus::new());

        let bus_clone = Arc::clone(&bus);
        let predicate: EventPredicate =
            Arc::new(|e: &Event| e.data.as_ref().is_some_and(|d| d == &serde_json::json!(2)));
        let waiter = tokio::spawn(async move {
            bus_clone
                .wait_for_event("tick", Some(Duration::from_secs(5)), Some(predicate))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit(event("tick").with_data(serde_json::json!(1)));
        bus.emit(event("tick").with_data(serde_json::json!(2)));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.data, Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn wait_for_any_event_first_match_wins() {
        let bus = Arc::new(EventBus::new());

        let bus_clone = Arc::clone(&bus);
        let waiter = tokio::spawn(async move {
            bus_clone
                .wait_for_any_event(&["a", "b"], Some(Duration::from_secs(5)), None)
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.emit(event("b"));
        bus.emit(event("a"));

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.event_type, "b");
    }

    #[tokio::test]
    async fn timed_out_waiter_is_deregistered() {
        let bus = EventBus::new();
        let _ = bus
            .wait_for_event("late", Some(Duration::from_millis(10)), None)
            .await;

        // The waiter should no longer be registered; emitting is harmless.
        bus.emit(event("late"));
        assert_eq!(bus.get_event_history(Some("late"), None, None).len(), 1);
    }
}

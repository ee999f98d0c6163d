//! # Event Bus
//!
//! In-process publish/subscribe between the ledger and its collaborators
//! (UI, analytics). Collaborators observe; they never write ledger state.
//!
//! ```text
//!   Ledger ──publish(event)──► EventBus ──snapshot──┬──► subscriber 1
//!                                                   ├──► subscriber 2
//!                                                   └──► subscriber n
//! ```
//!
//! ## Delivery
//! - Single-threaded, in subscription order, on the publishing thread.
//! - Only subscribers registered when `publish` is called receive the event.
//! - Nothing is persisted. A late subscriber asks for current state
//!   explicitly instead of expecting a backlog.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{ConflictRecord, Operation, ProjectionEntry, SyncToken};

// =============================================================================
// Events
// =============================================================================

/// Events emitted by a store's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// An operation entered the log (local or merged-in remote).
    OperationAppended {
        operation: Operation,
        #[ts(type = "number")]
        version: u64,
    },
    /// A SKU's projection entry changed.
    ProjectionChanged { entry: ProjectionEntry },
    /// Reconciliation produced a conflict record.
    ConflictDetected { conflict: ConflictRecord },
    /// An operator settled a manual review.
    ConflictResolved { conflict: ConflictRecord },
    /// A reconciliation round finished.
    Reconciled {
        #[ts(type = "number")]
        sync_point: u64,
        remote_applied: u32,
        compensations: u32,
        conflicts: u32,
        token: Option<SyncToken>,
    },
    /// The projection was discarded and replayed from the log.
    ProjectionRebuilt {
        #[ts(type = "number")]
        version: u64,
    },
}

impl LedgerEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::OperationAppended { .. } => "operation_appended",
            LedgerEvent::ProjectionChanged { .. } => "projection_changed",
            LedgerEvent::ConflictDetected { .. } => "conflict_detected",
            LedgerEvent::ConflictResolved { .. } => "conflict_resolved",
            LedgerEvent::Reconciled { .. } => "reconciled",
            LedgerEvent::ProjectionRebuilt { .. } => "projection_rebuilt",
        }
    }
}

// =============================================================================
// Subscribers
// =============================================================================

/// Receives ledger events.
pub trait EventSubscriber: Send + Sync {
    fn on_event(&self, event: &LedgerEvent);
}

impl<F> EventSubscriber for F
where
    F: Fn(&LedgerEvent) + Send + Sync,
{
    fn on_event(&self, event: &LedgerEvent) {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// =============================================================================
// Bus
// =============================================================================

/// Per-ledger event bus.
#[derive(Default)]
pub struct EventBus {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, Arc<dyn EventSubscriber>)>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscribers.push((id, subscriber));
        id
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Delivers `event` to every current subscriber.
    pub fn publish(&self, event: &LedgerEvent) {
        let snapshot: Vec<Arc<dyn EventSubscriber>> = self
            .subscribers
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();

        for subscriber in snapshot {
            subscriber.on_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn rebuilt(version: u64) -> LedgerEvent {
        LedgerEvent::ProjectionRebuilt { version }
    }

    #[test]
    fn test_publish_reaches_current_subscribers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new();

        let first = Arc::clone(&seen);
        bus.subscribe(Arc::new(move |event: &LedgerEvent| {
            first.lock().unwrap().push(format!("first:{}", event.name()));
        }));
        let second = Arc::clone(&seen);
        bus.subscribe(Arc::new(move |event: &LedgerEvent| {
            second.lock().unwrap().push(format!("second:{}", event.name()));
        }));

        bus.publish(&rebuilt(1));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "first:projection_rebuilt".to_string(),
                "second:projection_rebuilt".to_string()
            ]
        );
    }

    #[test]
    fn test_unsubscribe_and_no_backlog() {
        let count = Arc::new(Mutex::new(0));
        let mut bus = EventBus::new();

        bus.publish(&rebuilt(1));

        let counter = Arc::clone(&count);
        let id = bus.subscribe(Arc::new(move |_: &LedgerEvent| {
            *counter.lock().unwrap() += 1;
        }));
        // Events published before subscribing are not replayed.
        assert_eq!(*count.lock().unwrap(), 0);

        bus.publish(&rebuilt(2));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&rebuilt(3));

        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(rebuilt(7)).unwrap();
        assert_eq!(json["type"], "projection_rebuilt");
        assert_eq!(json["version"], 7);
    }
}

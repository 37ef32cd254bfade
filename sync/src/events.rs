//! Typed publish/subscribe channel between the queue owner, the sync worker
//! and the presentation layer.
//!
//! Delivery is best effort. Subscribers that lag lose the oldest events and
//! must tolerate duplicates and reordering, since every event only says
//! "look again".

use serde::{Deserialize, Serialize};
use tally_engine::{Override, QueueKind, RecordId};
use tokio::sync::broadcast;

const CAPACITY: usize = 256;

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Event {
    #[serde(rename = "queue.stores.changed")]
    StoresQueueChanged,
    #[serde(rename = "queue.payments.changed")]
    PaymentsQueueChanged,
    /// A local edit was applied to the overlay.
    #[serde(rename = "record.optimisticEdit")]
    OptimisticEdit { id: RecordId, fields: Override },
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Event::StoresQueueChanged => "queue.stores.changed",
            Event::PaymentsQueueChanged => "queue.payments.changed",
            Event::OptimisticEdit { .. } => "record.optimisticEdit",
        }
    }

    pub fn queue_changed(kind: QueueKind) -> Self {
        match kind {
            QueueKind::Stores => Event::StoresQueueChanged,
            QueueKind::Payments => Event::PaymentsQueueChanged,
        }
    }

    /// The queue this event reports on, if any.
    pub fn queue(&self) -> Option<QueueKind> {
        match self {
            Event::StoresQueueChanged => Some(QueueKind::Stores),
            Event::PaymentsQueueChanged => Some(QueueKind::Payments),
            Event::OptimisticEdit { .. } => None,
        }
    }
}

/// Owned by the root composition and handed to each component.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: Event) -> usize {
        tracing::trace!(topic = event.topic(), "Event published");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

//! WebSocket connection manager.
//!
//! Tracks the `/events` connections and fans Event Bus events out to them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{Event, EventBus};

/// Sender for WebSocket messages.
pub type EventSender = mpsc::UnboundedSender<Event>;

/// Manages active event feed connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, EventSender>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, sender: EventSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        self.connections.insert(conn_id.clone(), sender);
        tracing::info!(conn_id = %conn_id, "Event feed connection registered");
        conn_id
    }

    pub fn unregister(&self, conn_id: &str) {
        if self.connections.remove(conn_id).is_some() {
            tracing::info!(conn_id = %conn_id, "Event feed connection unregistered");
        }
    }

    /// Send an event to every connection. Returns how many accepted it.
    pub fn broadcast(&self, event: &Event) -> usize {
        let sent = self
            .connections
            .iter()
            .filter(|entry| entry.value().send(event.clone()).is_ok())
            .count();

        tracing::debug!(topic = event.topic(), recipients = sent, "Event broadcast");
        sent
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Forward every bus event to the connections until the bus closes.
    pub fn forward(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        manager.broadcast(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event feed lagged, events skipped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.register(tx);
        assert_eq!(manager.connection_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn broadcast_skips_closed_connections() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        manager.register(tx1);
        manager.register(tx2);
        drop(rx2);

        assert_eq!(manager.broadcast(&Event::StoresQueueChanged), 1);
        assert_eq!(rx1.try_recv().unwrap(), Event::StoresQueueChanged);
    }

    #[tokio::test]
    async fn forwards_bus_events() {
        let manager = ConnectionManager::new_shared();
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register(tx);
        let _task = manager.forward(&bus);

        bus.publish(Event::PaymentsQueueChanged);
        assert_eq!(rx.recv().await.unwrap(), Event::PaymentsQueueChanged);
    }
}

//! EventBus / Namespace Fabric (spec.md §4.1).
//!
//! Generalizes the teacher's `ws_sessions: HashMap<RoomUserID,
//! SharifyWsInstance>` single flat map (`sharify/websocket/instance.rs`) into
//! one map *per namespace*, which is what makes cross-room leakage
//! structurally impossible rather than merely filtered-out at send time.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use super::messages::ServerEvent;

pub type ConnectionId = uuid::Uuid;

#[derive(Clone)]
struct Subscriber {
    sender: mpsc::Sender<ServerEvent>,
}

#[derive(Default)]
struct Namespace {
    subscribers: HashMap<ConnectionId, Subscriber>,
}

/// Per-namespace, per-publisher FIFO pub/sub fabric. Namespaces are looked
/// up by string path (`/lobby-monitor`, `/room/<id>`, `/approval/<id>`);
/// publishing to a namespace that doesn't exist is a no-op (spec.md §4.1
/// "Failure semantics").
#[derive(Default)]
pub struct EventBus {
    namespaces: RwLock<HashMap<String, Namespace>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_namespace(&self, path: &str) {
        self.namespaces
            .write()
            .await
            .entry(path.to_owned())
            .or_default();
    }

    /// Implicitly unsubscribes all remaining subscribers.
    pub async fn destroy_namespace(&self, path: &str) {
        self.namespaces.write().await.remove(path);
    }

    /// Returns the per-connection receiver end; the caller (the WebSocket
    /// connection task) drains it and forwards frames to the actual socket.
    pub async fn subscribe(
        &self,
        path: &str,
        conn: ConnectionId,
        buffer: usize,
    ) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut guard = self.namespaces.write().await;
        let ns = guard.entry(path.to_owned()).or_default();
        ns.subscribers.insert(conn, Subscriber { sender: tx });
        rx
    }

    pub async fn unsubscribe(&self, path: &str, conn: ConnectionId) {
        if let Some(ns) = self.namespaces.write().await.get_mut(path) {
            ns.subscribers.remove(&conn);
        }
    }

    /// Removes `conn` from every namespace it is a member of (disconnect /
    /// backpressure eviction).
    pub async fn unsubscribe_all(&self, conn: ConnectionId) {
        let mut guard = self.namespaces.write().await;
        for ns in guard.values_mut() {
            ns.subscribers.remove(&conn);
        }
    }

    /// Publish to every subscriber of `path`. A subscriber whose outbound
    /// buffer is full or closed is skipped without affecting delivery to the
    /// others (spec.md §4.1 "Subscriber send errors are isolated").
    pub async fn publish(&self, path: &str, event: ServerEvent) {
        self.publish_filtered(path, event, None).await;
    }

    /// Broadcast-except-sender (spec.md §4.1).
    pub async fn publish_except(&self, path: &str, excluded: ConnectionId, event: ServerEvent) {
        self.publish_filtered(path, event, Some(excluded)).await;
    }

    /// Deliver directly to one connection regardless of namespace (used for
    /// targeted server->client replies such as swap/voice signaling).
    pub async fn send_to(&self, path: &str, conn: ConnectionId, event: ServerEvent) {
        let sender = {
            let guard = self.namespaces.read().await;
            guard
                .get(path)
                .and_then(|ns| ns.subscribers.get(&conn))
                .map(|s| s.sender.clone())
        };

        if let Some(sender) = sender {
            let _ = sender.try_send(event);
        } else {
            log::warn!("publish to nonexistent namespace or connection: {path}");
        }
    }

    async fn publish_filtered(
        &self,
        path: &str,
        event: ServerEvent,
        excluded: Option<ConnectionId>,
    ) {
        let senders: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> = {
            let guard = self.namespaces.read().await;
            let Some(ns) = guard.get(path) else {
                log::warn!("publish to nonexistent namespace: {path}");
                return;
            };

            ns.subscribers
                .iter()
                .filter(|(id, _)| Some(**id) != excluded)
                .map(|(id, sub)| (*id, sub.sender.clone()))
                .collect()
        };

        // FIFO per publisher: sends happen in subscriber-map iteration order
        // for *this* publish call, and each subscriber's own channel is FIFO
        // across calls, so per-subscriber ordering from a single publisher is
        // preserved end to end.
        for (conn, sender) in senders {
            if sender.try_send(event.clone()).is_err() {
                log::debug!("dropping event for slow/closed subscriber {conn}, disconnecting");
                self.unsubscribe(path, conn).await;
            }
        }
    }

    pub async fn namespace_exists(&self, path: &str) -> bool {
        self.namespaces.read().await.contains_key(path)
    }

    pub async fn subscriber_count(&self, path: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(path)
            .map(|ns| ns.subscribers.len())
            .unwrap_or(0)
    }
}

pub type SharedEventBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_isolated_per_namespace() {
        let bus = EventBus::new();
        let a = ConnectionId::new_v4();
        let b = ConnectionId::new_v4();

        let mut rx_a = bus.subscribe("/room/A", a, 8).await;
        let mut rx_b = bus.subscribe("/room/B", b, 8).await;

        bus.publish("/room/A", ServerEvent::StopAllNotes { user_id: "x".into() })
            .await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_except_sender_skips_excluded() {
        let bus = EventBus::new();
        let sender = ConnectionId::new_v4();
        let other = ConnectionId::new_v4();

        let mut rx_sender = bus.subscribe("/room/r", sender, 8).await;
        let mut rx_other = bus.subscribe("/room/r", other, 8).await;

        bus.publish_except(
            "/room/r",
            sender,
            ServerEvent::StopAllNotes { user_id: "x".into() },
        )
        .await;

        assert!(rx_sender.try_recv().is_err());
        assert!(rx_other.try_recv().is_ok());
    }

    #[tokio::test]
    async fn publish_to_missing_namespace_is_noop() {
        let bus = EventBus::new();
        bus.publish("/room/ghost", ServerEvent::StopAllNotes { user_id: "x".into() })
            .await;
    }

    #[tokio::test]
    async fn destroy_namespace_unsubscribes_everyone() {
        let bus = EventBus::new();
        let conn = ConnectionId::new_v4();
        bus.subscribe("/room/r", conn, 8).await;
        assert_eq!(bus.subscriber_count("/room/r").await, 1);

        bus.destroy_namespace("/room/r").await;
        assert!(!bus.namespace_exists("/room/r").await);
    }
}

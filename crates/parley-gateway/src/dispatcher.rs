use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

/// In-memory presence registry: maps each connected user to the channel that
/// feeds their socket. One handle per user; a reconnect replaces the old entry
/// (last writer wins) and the conn id guard keeps the old connection's
/// teardown from evicting the new one.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for presence events — every connection receives these
    broadcast_tx: broadcast::Sender<GatewayEvent>,

    /// Per-user targeted send channels: user_id -> (conn_id, sender)
    user_channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<GatewayEvent>)>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to broadcast events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to every connected client.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Register a connection's send handle for `user_id`, replacing any prior
    /// handle. Returns the conn id this registration is keyed by.
    pub async fn register(&self, user_id: Uuid, tx: mpsc::UnboundedSender<GatewayEvent>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.inner
            .user_channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        conn_id
    }

    /// Remove `user_id`'s entry, but only if `conn_id` still owns it. Returns
    /// whether the entry was removed — false means a newer connection took
    /// over and the caller must not broadcast an offline transition.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut channels = self.inner.user_channels.write().await;
        if let Some((stored_conn_id, _)) = channels.get(&user_id) {
            if *stored_conn_id == conn_id {
                channels.remove(&user_id);
                return true;
            }
        }
        false
    }

    /// Push a targeted event to `user_id` if they are reachable. Returns
    /// whether a registered handle accepted the event.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        let channels = self.inner.user_channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            return tx.send(event).is_ok();
        }
        false
    }

    /// Whether `user_id` currently has a registered connection.
    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.user_channels.read().await.contains_key(&user_id)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(user_id: Uuid) -> GatewayEvent {
        GatewayEvent::Ready {
            user_id,
            username: "test".into(),
        }
    }

    #[tokio::test]
    async fn registered_user_receives_targeted_events() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.register(user, tx).await;
        assert!(dispatcher.send_to_user(user, ready(user)).await);
        assert!(matches!(rx.recv().await, Some(GatewayEvent::Ready { .. })));
    }

    #[tokio::test]
    async fn send_to_unregistered_user_is_a_noop() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        assert!(!dispatcher.send_to_user(user, ready(user)).await);
    }

    #[tokio::test]
    async fn reconnect_replaces_the_old_handle() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        let _old = dispatcher.register(user, tx1).await;
        dispatcher.register(user, tx2).await;

        assert!(dispatcher.send_to_user(user, ready(user)).await);
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stale_unregister_does_not_evict_newer_connection() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let old_conn = dispatcher.register(user, tx1).await;
        let new_conn = dispatcher.register(user, tx2).await;

        // The first connection tears down late; the new registration survives.
        assert!(!dispatcher.unregister(user, old_conn).await);
        assert!(dispatcher.is_online(user).await);

        assert!(dispatcher.unregister(user, new_conn).await);
        assert!(!dispatcher.is_online(user).await);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let dispatcher = Dispatcher::new();
        let mut rx1 = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();

        dispatcher.broadcast(GatewayEvent::PeerOnline {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
        });

        assert!(matches!(rx1.recv().await, Ok(GatewayEvent::PeerOnline { .. })));
        assert!(matches!(rx2.recv().await, Ok(GatewayEvent::PeerOnline { .. })));
    }
}

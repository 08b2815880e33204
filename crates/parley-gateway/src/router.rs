use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_db::Database;
use parley_db::queries::MAX_CONTENT_LEN;
use parley_types::events::GatewayEvent;
use parley_types::models::Message;

use crate::dispatcher::Dispatcher;
use crate::error::{ChatError, ChatResult};

/// Orchestrates the stateful pipelines: message send, read receipts, and the
/// typing relay. Shared by the socket command loop and the HTTP handlers so
/// both entry points get identical semantics.
#[derive(Clone)]
pub struct MessageRouter {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl MessageRouter {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    /// The send pipeline: validate, find-or-create the conversation, persist
    /// the message, fold it into the conversation aggregate, then best-effort
    /// push to the recipient. Returns the accepted message for the caller to
    /// ack — acceptance does not depend on the recipient being reachable.
    pub async fn send_message(
        &self,
        sender_id: Uuid,
        sender_username: &str,
        receiver_id: Uuid,
        content: &str,
    ) -> ChatResult<Message> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::Validation("message content is required".into()));
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(ChatError::Validation(format!(
                "message cannot exceed {MAX_CONTENT_LEN} characters"
            )));
        }
        if receiver_id == sender_id {
            return Err(ChatError::Validation(
                "cannot send a message to yourself".into(),
            ));
        }

        let rid = receiver_id.to_string();
        self.with_db(move |db| db.get_user_by_id(&rid))
            .await?
            .ok_or_else(|| ChatError::NotFound("recipient not found".into()))?;

        let sid = sender_id.to_string();
        let rid = receiver_id.to_string();
        let conversation = self
            .with_db(move |db| db.find_or_create_conversation(&sid, &rid))
            .await?;

        let message_id = Uuid::new_v4();
        let created_at = Utc::now();
        let content = content.to_string();

        {
            let mid = message_id.to_string();
            let cid = conversation.id.clone();
            let sid = sender_id.to_string();
            let rid = receiver_id.to_string();
            let body = content.clone();
            let stamp = created_at.to_rfc3339();
            self.with_db(move |db| db.insert_message(&mid, &cid, &sid, &rid, &body, &stamp))
                .await?;
        }

        {
            let mid = message_id.to_string();
            let cid = conversation.id.clone();
            let rid = receiver_id.to_string();
            self.with_db(move |db| db.apply_new_message(&cid, &rid, &mid))
                .await?;
        }

        let message = Message {
            id: message_id,
            conversation_id: parse_id(&conversation.id),
            sender_id,
            sender_username: sender_username.to_string(),
            receiver_id,
            content,
            is_read: false,
            read_at: None,
            created_at,
        };

        // Best-effort push; an offline recipient keeps the message stored and
        // unread, with no retry or queue.
        let delivered = self
            .dispatcher
            .send_to_user(receiver_id, GatewayEvent::MessageDelivered(message.clone()))
            .await;
        debug!(
            "message {} from {} to {} ({})",
            message_id,
            sender_id,
            receiver_id,
            if delivered { "pushed" } else { "recipient offline" }
        );

        Ok(message)
    }

    /// The read-receipt pipeline: flip the reader's unread messages, zero the
    /// reader's counter (even when nothing was flipped, to correct drift), and
    /// tell the other participant if they are reachable. An unknown
    /// conversation, or one the reader is not part of, is reported as NotFound
    /// on every entry point.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> ChatResult<usize> {
        let cid = conversation_id.to_string();
        let conversation = self
            .with_db(move |db| db.get_conversation(&cid))
            .await?
            .ok_or_else(|| ChatError::NotFound("conversation not found".into()))?;

        let reader = reader_id.to_string();
        let peer_id = conversation
            .peer_of(&reader)
            .ok_or_else(|| ChatError::NotFound("conversation not found".into()))?
            .to_string();

        let affected = {
            let cid = conversation.id.clone();
            let reader = reader.clone();
            self.with_db(move |db| db.mark_read_batch(&cid, &reader))
                .await?
        };

        {
            let cid = conversation.id.clone();
            self.with_db(move |db| db.reset_unread(&cid, &reader)).await?;
        }

        match peer_id.parse::<Uuid>() {
            Ok(peer) => {
                self.dispatcher
                    .send_to_user(peer, GatewayEvent::ConversationRead { conversation_id })
                    .await;
            }
            Err(e) => warn!(
                "Corrupt participant id '{}' on conversation '{}': {}",
                peer_id, conversation.id, e
            ),
        }

        Ok(affected)
    }

    /// Ephemeral typing relay: forwarded if the peer is reachable, dropped
    /// otherwise. Never persisted.
    pub async fn notify_typing(&self, from_id: Uuid, from_username: &str, to_id: Uuid) {
        self.dispatcher
            .send_to_user(
                to_id,
                GatewayEvent::PeerTyping {
                    user_id: from_id,
                    username: from_username.to_string(),
                },
            )
            .await;
    }

    pub async fn notify_stop_typing(&self, from_id: Uuid, to_id: Uuid) {
        self.dispatcher
            .send_to_user(to_id, GatewayEvent::PeerStoppedTyping { user_id: from_id })
            .await;
    }

    /// Run a store operation off the async runtime. The spawned task runs to
    /// completion even if the calling connection goes away, so a persistence
    /// step that started is never abandoned mid-pipeline.
    async fn with_db<T, F>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ChatError::Store(anyhow::anyhow!("store task failed: {e}")))?
            .map_err(ChatError::Store)
    }
}

fn parse_id(raw: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt id '{}': {}", raw, e);
        Uuid::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct Fixture {
        router: MessageRouter,
        db: Arc<Database>,
        dispatcher: Dispatcher,
        alice: Uuid,
        bob: Uuid,
    }

    fn seed_user(db: &Database, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), username, "hash", None)
            .unwrap();
        id
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let router = MessageRouter::new(db.clone(), dispatcher.clone());
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        Fixture {
            router,
            db,
            dispatcher,
            alice,
            bob,
        }
    }

    #[tokio::test]
    async fn whitespace_content_is_rejected_without_side_effects() {
        let f = fixture();
        let result = f.router.send_message(f.alice, "alice", f.bob, "   \n\t").await;
        assert!(matches!(result, Err(ChatError::Validation(_))));

        // Nothing persisted: no conversation was created for the pair.
        let convs = f.db.list_conversations_for(&f.alice.to_string()).unwrap();
        assert!(convs.is_empty());
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let f = fixture();
        let body = "x".repeat(MAX_CONTENT_LEN + 1);
        let result = f.router.send_message(f.alice, "alice", f.bob, &body).await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn self_addressed_message_is_rejected() {
        let f = fixture();
        let result = f.router.send_message(f.alice, "alice", f.alice, "hi me").await;
        assert!(matches!(result, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected() {
        let f = fixture();
        let result = f
            .router
            .send_message(f.alice, "alice", Uuid::new_v4(), "hello?")
            .await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn send_to_offline_recipient_is_stored_and_counted() {
        let f = fixture();
        let message = f
            .router
            .send_message(f.alice, "alice", f.bob, "  hi bob  ")
            .await
            .unwrap();

        // Content arrives trimmed; the ack reflects the persisted state.
        assert_eq!(message.content, "hi bob");
        assert!(!message.is_read);

        let conv_id = message.conversation_id.to_string();
        assert_eq!(f.db.unread_count(&conv_id, &f.bob.to_string()).unwrap(), 1);

        let rows = f.db.list_messages(&conv_id, 10, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "hi bob");
        assert!(!rows[0].is_read);
    }

    #[tokio::test]
    async fn send_pushes_to_a_registered_recipient() {
        let f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.dispatcher.register(f.bob, tx).await;

        let accepted = f
            .router
            .send_message(f.alice, "alice", f.bob, "ping")
            .await
            .unwrap();

        match rx.recv().await {
            Some(GatewayEvent::MessageDelivered(delivered)) => {
                assert_eq!(delivered.id, accepted.id);
                assert_eq!(delivered.content, "ping");
                assert_eq!(delivered.sender_username, "alice");
                assert_eq!(delivered.created_at, accepted.created_at);
            }
            other => panic!("expected MessageDelivered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_sends_never_lose_unread_increments() {
        let f = fixture();
        const N: usize = 16;

        let mut handles = Vec::new();
        for i in 0..N {
            let router = f.router.clone();
            let (alice, bob) = (f.alice, f.bob);
            handles.push(tokio::spawn(async move {
                router
                    .send_message(alice, "alice", bob, &format!("msg {i}"))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let conv = f
            .db
            .find_or_create_conversation(&f.alice.to_string(), &f.bob.to_string())
            .unwrap();
        assert_eq!(f.db.unread_count(&conv.id, &f.bob.to_string()).unwrap(), N as i64);
        assert_eq!(f.db.count_messages(&conv.id).unwrap(), N as i64);
    }

    #[tokio::test]
    async fn mark_read_resets_counter_and_notifies_the_peer() {
        let f = fixture();
        f.router
            .send_message(f.alice, "alice", f.bob, "one")
            .await
            .unwrap();
        let second = f
            .router
            .send_message(f.alice, "alice", f.bob, "two")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        f.dispatcher.register(f.alice, tx).await;

        let affected = f
            .router
            .mark_conversation_read(second.conversation_id, f.bob)
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let conv_id = second.conversation_id.to_string();
        assert_eq!(f.db.unread_count(&conv_id, &f.bob.to_string()).unwrap(), 0);
        for row in f.db.list_messages(&conv_id, 10, 0).unwrap() {
            assert!(row.is_read);
            assert!(row.read_at.is_some());
        }

        match rx.recv().await {
            Some(GatewayEvent::ConversationRead { conversation_id }) => {
                assert_eq!(conversation_id, second.conversation_id);
            }
            other => panic!("expected ConversationRead, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mark_read_with_zero_unread_still_resets() {
        let f = fixture();
        let message = f
            .router
            .send_message(f.alice, "alice", f.bob, "hello")
            .await
            .unwrap();

        let first = f
            .router
            .mark_conversation_read(message.conversation_id, f.bob)
            .await
            .unwrap();
        assert_eq!(first, 1);

        // Second pass affects nothing but still succeeds and leaves zero.
        let second = f
            .router
            .mark_conversation_read(message.conversation_id, f.bob)
            .await
            .unwrap();
        assert_eq!(second, 0);
        assert_eq!(
            f.db.unread_count(&message.conversation_id.to_string(), &f.bob.to_string())
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn mark_read_on_unknown_conversation_is_not_found() {
        let f = fixture();
        let result = f.router.mark_conversation_read(Uuid::new_v4(), f.bob).await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn mark_read_by_non_participant_is_not_found() {
        let f = fixture();
        let carol = seed_user(&f.db, "carol");
        let message = f
            .router
            .send_message(f.alice, "alice", f.bob, "private")
            .await
            .unwrap();

        let result = f
            .router
            .mark_conversation_read(message.conversation_id, carol)
            .await;
        assert!(matches!(result, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn typing_relay_reaches_a_connected_peer_only() {
        let f = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        f.dispatcher.register(f.bob, tx).await;

        f.router.notify_typing(f.alice, "alice", f.bob).await;
        f.router.notify_stop_typing(f.alice, f.bob).await;
        // Relaying toward someone offline is a silent no-op.
        f.router.notify_typing(f.bob, "bob", f.alice).await;

        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::PeerTyping { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(GatewayEvent::PeerStoppedTyping { .. })
        ));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A message addressed to this connection's user was delivered
    MessageDelivered(Message),

    /// Ack to the sender: the message was persisted and counted
    MessageAccepted(Message),

    /// The peer started typing in a conversation with this user
    PeerTyping { user_id: Uuid, username: String },

    /// The peer stopped typing
    PeerStoppedTyping { user_id: Uuid },

    /// A user connected to the gateway
    PeerOnline { user_id: Uuid, username: String },

    /// A user disconnected from the gateway
    PeerOffline {
        user_id: Uuid,
        last_seen: Option<DateTime<Utc>>,
    },

    /// The other participant read the conversation
    ConversationRead { conversation_id: Uuid },

    /// A command from this connection failed; surfaced only to the originator
    OperationFailed { message: String },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Send a direct message
    Send { receiver_id: Uuid, content: String },

    /// Indicate typing to another user
    Typing { receiver_id: Uuid },

    /// Stop the typing indicator
    StopTyping { receiver_id: Uuid },

    /// Mark every unread message in a conversation as read
    MarkRead { conversation_id: Uuid },
}

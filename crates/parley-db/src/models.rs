//! Database row types — these map directly to SQLite rows.
//! Distinct from the parley-types wire models; conversions live here so the
//! handlers never touch raw column values.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use parley_types::models::{ConversationSummary, Message, PeerProfile};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub avatar: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub last_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub receiver_id: String,
    pub content: String,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub created_at: String,
}

/// One row of the conversation-list query: the conversation joined with the
/// other participant's profile and the caller's unread count.
pub struct ConversationListRow {
    pub id: String,
    pub last_message_id: Option<String>,
    pub updated_at: String,
    pub other: UserRow,
    pub unread_count: i64,
}

impl ConversationRow {
    /// The participant opposite `user_id`, or None when `user_id` is not part
    /// of this conversation.
    pub fn peer_of(&self, user_id: &str) -> Option<&str> {
        if self.participant_a == user_id {
            Some(&self.participant_b)
        } else if self.participant_b == user_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}

impl UserRow {
    pub fn into_profile(self) -> PeerProfile {
        PeerProfile {
            id: parse_uuid(&self.id, "user id"),
            username: self.username,
            avatar: self.avatar,
            is_online: self.is_online,
            last_seen: self.last_seen.as_deref().map(parse_datetime),
        }
    }
}

impl ConversationListRow {
    pub fn into_summary(self, last_message: Option<Message>) -> ConversationSummary {
        ConversationSummary {
            id: parse_uuid(&self.id, "conversation id"),
            other_user: self.other.into_profile(),
            last_message,
            unread_count: self.unread_count,
            updated_at: parse_datetime(&self.updated_at),
        }
    }
}

impl MessageRow {
    pub fn into_message(self) -> Message {
        Message {
            id: parse_uuid(&self.id, "message id"),
            conversation_id: parse_uuid(&self.conversation_id, "conversation id"),
            sender_id: parse_uuid(&self.sender_id, "sender id"),
            sender_username: self.sender_username,
            receiver_id: parse_uuid(&self.receiver_id, "receiver id"),
            content: self.content,
            is_read: self.is_read,
            read_at: self.read_at.as_deref().map(parse_datetime),
            created_at: parse_datetime(&self.created_at),
        }
    }
}

fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

/// Timestamps written by this crate are RFC 3339; column defaults produced by
/// SQLite are "YYYY-MM-DD HH:MM:SS" without a timezone. Accept both.
pub fn parse_datetime(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

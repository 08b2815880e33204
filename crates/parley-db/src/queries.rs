use crate::Database;
use crate::models::{ConversationListRow, ConversationRow, MessageRow, UserRow};
use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

/// Longest accepted message body, in characters.
pub const MAX_CONTENT_LEN: usize = 1000;

impl Database {
    // -- Users --

    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        password_hash: &str,
        avatar: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, avatar) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, avatar),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password, avatar, is_online, last_seen, created_at FROM users WHERE username = ?1", username)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            query_user(conn, "SELECT id, username, password, avatar, is_online, last_seen, created_at FROM users WHERE id = ?1", id)
        })
    }

    /// All users except `user_id`, online users first, then by username.
    pub fn list_users_except(&self, user_id: &str) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, password, avatar, is_online, last_seen, created_at
                 FROM users
                 WHERE id != ?1
                 ORDER BY is_online DESC, username ASC",
            )?;
            let rows = stmt
                .query_map([user_id], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn set_user_online(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("UPDATE users SET is_online = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    pub fn set_user_offline(&self, id: &str, last_seen: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET is_online = 0, last_seen = ?2 WHERE id = ?1",
                (id, last_seen),
            )?;
            Ok(())
        })
    }

    // -- Conversations --

    /// Look up the conversation for an unordered pair of users, creating it on
    /// first contact. Idempotent and argument-order independent: the pair is
    /// canonicalized (sorted) before hitting the UNIQUE(participant_a,
    /// participant_b) constraint, and a constraint violation from a concurrent
    /// insert degrades into a retried lookup.
    pub fn find_or_create_conversation(&self, user_a: &str, user_b: &str) -> Result<ConversationRow> {
        if user_a == user_b {
            bail!("a conversation requires two distinct participants");
        }
        let (lo, hi) = if user_a < user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        self.with_conn(|conn| {
            if let Some(row) = query_conversation_by_pair(conn, lo, hi)? {
                return Ok(row);
            }

            let id = Uuid::new_v4().to_string();
            // Timestamps are written explicitly so updated_at stays in one
            // format and sorts correctly against later aggregate bumps.
            let now = Utc::now().to_rfc3339();
            let insert = conn.execute(
                "INSERT INTO conversations (id, participant_a, participant_b, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                (&id, lo, hi, &now),
            );
            match insert {
                Ok(_) => {
                    conn.execute(
                        "INSERT OR IGNORE INTO conversation_unread (conversation_id, user_id, count)
                         VALUES (?1, ?2, 0), (?1, ?3, 0)",
                        (&id, lo, hi),
                    )?;
                }
                // Lost the insert race: the pair's conversation exists now.
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation => {}
                Err(e) => return Err(e.into()),
            }

            query_conversation_by_pair(conn, lo, hi)?
                .ok_or_else(|| anyhow!("conversation missing after insert for pair ({lo}, {hi})"))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, participant_a, participant_b, last_message_id, created_at, updated_at
                 FROM conversations WHERE id = ?1",
            )?;
            stmt.query_row([id], map_conversation_row).optional()
        })
    }

    /// Conversations `user_id` participates in, most recently active first,
    /// joined with the other participant's profile and the caller's unread
    /// count (zero when no counter row exists yet).
    pub fn list_conversations_for(&self, user_id: &str) -> Result<Vec<ConversationListRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.last_message_id, c.updated_at,
                        u.id, u.username, u.password, u.avatar, u.is_online, u.last_seen, u.created_at,
                        COALESCE(un.count, 0)
                 FROM conversations c
                 JOIN users u
                   ON u.id = CASE WHEN c.participant_a = ?1 THEN c.participant_b ELSE c.participant_a END
                 LEFT JOIN conversation_unread un
                   ON un.conversation_id = c.id AND un.user_id = ?1
                 WHERE c.participant_a = ?1 OR c.participant_b = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationListRow {
                        id: row.get(0)?,
                        last_message_id: row.get(1)?,
                        updated_at: row.get(2)?,
                        other: UserRow {
                            id: row.get(3)?,
                            username: row.get(4)?,
                            password: row.get(5)?,
                            avatar: row.get(6)?,
                            is_online: row.get(7)?,
                            last_seen: row.get(8)?,
                            created_at: row.get(9)?,
                        },
                        unread_count: row.get(10)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Fold a freshly stored message into the conversation aggregate: advance
    /// the last-message pointer, bump updated_at, and increment the
    /// recipient's unread counter. The increment is a single UPSERT, so
    /// concurrent sends into the same conversation cannot lose counts.
    pub fn apply_new_message(
        &self,
        conversation_id: &str,
        recipient_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE conversations SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
                (conversation_id, message_id, &now),
            )?;
            if updated == 0 {
                bail!("conversation not found: {conversation_id}");
            }
            conn.execute(
                "INSERT INTO conversation_unread (conversation_id, user_id, count) VALUES (?1, ?2, 1)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = count + 1",
                (conversation_id, recipient_id),
            )?;
            Ok(())
        })
    }

    /// Set `user_id`'s unread counter to zero, regardless of its prior value.
    pub fn reset_unread(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversation_unread (conversation_id, user_id, count) VALUES (?1, ?2, 0)
                 ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = 0",
                (conversation_id, user_id),
            )?;
            conn.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                (conversation_id, &now),
            )?;
            Ok(())
        })
    }

    pub fn unread_count(&self, conversation_id: &str, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM conversation_unread WHERE conversation_id = ?1 AND user_id = ?2",
                    (conversation_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            // Unknown participant or untouched conversation reads as zero.
            Ok(count.unwrap_or(0))
        })
    }

    // -- Messages --

    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        receiver_id: &str,
        content: &str,
        created_at: &str,
    ) -> Result<()> {
        // Callers validate up front; the store still refuses bodies it must
        // never hold.
        if content.trim().is_empty() {
            bail!("message content is required");
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            bail!("message cannot exceed {MAX_CONTENT_LEN} characters");
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, receiver_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                (id, conversation_id, sender_id, receiver_id, content, created_at),
            )?;
            Ok(())
        })
    }

    /// One page of a conversation's log, newest first. Callers reverse for a
    /// reading order. The rowid tiebreak keeps pagination stable when several
    /// messages share a timestamp.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.receiver_id,
                        m.content, m.is_read, m.read_at, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC, m.rowid DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit, offset], map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_messages(&self, conversation_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Batch-fetch messages by id, for decorating conversation summaries.
    pub fn get_messages_by_ids(&self, message_ids: &[String]) -> Result<Vec<MessageRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT m.id, m.conversation_id, m.sender_id, u.username, m.receiver_id,
                        m.content, m.is_read, m.read_at, m.created_at
                 FROM messages m
                 LEFT JOIN users u ON m.sender_id = u.id
                 WHERE m.id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), map_message_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Flip every unread message in the conversation addressed to `reader_id`
    /// to read. Returns the number of messages affected; zero is fine.
    pub fn mark_read_batch(&self, conversation_id: &str, reader_id: &str) -> Result<usize> {
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE messages SET is_read = 1, read_at = ?3
                 WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0",
                (conversation_id, reader_id, &now),
            )?;
            Ok(affected)
        })
    }
}

fn query_user(conn: &Connection, sql: &str, key: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(sql)?;
    stmt.query_row([key], map_user_row).optional()
}

fn query_conversation_by_pair(
    conn: &Connection,
    lo: &str,
    hi: &str,
) -> Result<Option<ConversationRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, participant_a, participant_b, last_message_id, created_at, updated_at
         FROM conversations WHERE participant_a = ?1 AND participant_b = ?2",
    )?;
    stmt.query_row([lo, hi], map_conversation_row).optional()
}

fn map_user_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        username: row.get(1)?,
        password: row.get(2)?,
        avatar: row.get(3)?,
        is_online: row.get(4)?,
        last_seen: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn map_conversation_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ConversationRow, rusqlite::Error> {
    Ok(ConversationRow {
        id: row.get(0)?,
        participant_a: row.get(1)?,
        participant_b: row.get(2)?,
        last_message_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        receiver_id: row.get(4)?,
        content: row.get(5)?,
        is_read: row.get(6)?,
        read_at: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

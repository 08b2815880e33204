use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Message;

// -- JWT Claims --

/// JWT claims shared between the REST middleware and the gateway upgrade
/// handler. Canonical definition lives here to avoid drift between the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Message history --

/// Paginated history page, oldest message first.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageHistoryResponse {
    pub count: usize,
    pub total_messages: i64,
    pub current_page: u32,
    pub total_pages: i64,
    pub data: Vec<Message>,
}

// -- Read receipts --

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadResponse {
    /// How many messages were flipped to read by this call.
    pub marked: usize,
}

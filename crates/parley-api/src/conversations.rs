use std::collections::HashMap;

use anyhow::anyhow;
use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use parley_types::api::{Claims, MarkReadResponse, MessageHistoryResponse};
use parley_types::models::{ConversationSummary, Message};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

/// The caller's conversations, most recently active first, each decorated
/// with the other participant, the latest message, and the caller's unread
/// count.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();

    let (rows, last_rows) = tokio::task::spawn_blocking(move || {
        let rows = db.list_conversations_for(&uid)?;
        let last_ids: Vec<String> = rows
            .iter()
            .filter_map(|r| r.last_message_id.clone())
            .collect();
        let last_rows = db.get_messages_by_ids(&last_ids)?;
        anyhow::Ok((rows, last_rows))
    })
    .await
    .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {e}")))??;

    let mut last_by_id: HashMap<String, Message> = last_rows
        .into_iter()
        .map(|row| (row.id.clone(), row.into_message()))
        .collect();

    let summaries: Vec<ConversationSummary> = rows
        .into_iter()
        .map(|row| {
            let last = row
                .last_message_id
                .as_ref()
                .and_then(|id| last_by_id.remove(id));
            row.into_summary(last)
        })
        .collect();

    Ok(Json(summaries))
}

/// Paginated history with the user at `user_id`. The conversation is created
/// lazily on first fetch, so opening a chat with someone new yields an empty
/// first page instead of an error. Pages come back oldest-first.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    if user_id == claims.sub {
        return Err(ApiError::Validation(
            "cannot fetch a conversation with yourself".into(),
        ));
    }

    let page = query.page.max(1);
    let limit = query.limit.clamp(1, 200);

    let db = state.db.clone();
    let me = claims.sub.to_string();
    let other = user_id.to_string();

    let (rows, total) = tokio::task::spawn_blocking(move || {
        if db.get_user_by_id(&other)?.is_none() {
            return Ok(None);
        }
        let conversation = db.find_or_create_conversation(&me, &other)?;
        let rows = db.list_messages(&conversation.id, limit, (page - 1) * limit)?;
        let total = db.count_messages(&conversation.id)?;
        anyhow::Ok(Some((rows, total)))
    })
    .await
    .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {e}")))??
    .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

    // Store order is newest first; present oldest first.
    let mut data: Vec<Message> = rows.into_iter().map(|row| row.into_message()).collect();
    data.reverse();

    let limit = limit as i64;
    let total_pages = (total + limit - 1) / limit;

    Ok(Json(MessageHistoryResponse {
        count: data.len(),
        total_messages: total,
        current_page: page,
        total_pages,
        data,
    }))
}

/// HTTP entry point of the read-receipt flow; same semantics as the socket
/// command, including the NotFound report for an unknown conversation.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let marked = state
        .router
        .mark_conversation_read(conversation_id, claims.sub)
        .await?;

    Ok(Json(MarkReadResponse { marked }))
}

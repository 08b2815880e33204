use anyhow::anyhow;
use axum::{Extension, Json, extract::State, response::IntoResponse};

use parley_types::api::Claims;
use parley_types::models::PeerProfile;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

/// Everyone except the caller, online users first — the pick-someone-to-talk-to
/// listing.
pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let rows = tokio::task::spawn_blocking(move || db.list_users_except(&uid))
        .await
        .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {e}")))??;

    let profiles: Vec<PeerProfile> = rows.into_iter().map(|row| row.into_profile()).collect();
    Ok(Json(profiles))
}

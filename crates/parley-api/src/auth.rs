use std::sync::Arc;

use anyhow::anyhow;
use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use uuid::Uuid;

use parley_db::Database;
use parley_gateway::router::MessageRouter;
use parley_types::api::{Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};

use crate::error::{ApiError, ApiResult};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub router: MessageRouter,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::Validation(
            "username must be 3-32 characters".into(),
        ));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation(
            "password must be at least 8 characters".into(),
        ));
    }

    let taken = {
        let db = state.db.clone();
        let username = req.username.clone();
        tokio::task::spawn_blocking(move || db.get_user_by_username(&username))
            .await
            .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {e}")))??
            .is_some()
    };
    if taken {
        return Err(ApiError::Conflict("username is already taken".into()));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(anyhow!("password hash failed: {e}")))?
        .to_string();

    let user_id = Uuid::new_v4();

    {
        let db = state.db.clone();
        let username = req.username.clone();
        let avatar = req.avatar.clone();
        tokio::task::spawn_blocking(move || {
            db.create_user(&user_id.to_string(), &username, &password_hash, avatar.as_deref())
        })
        .await
        .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {e}")))??;
    }

    let token = create_token(&state.jwt_secret, user_id, &req.username)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = {
        let db = state.db.clone();
        let username = req.username.clone();
        tokio::task::spawn_blocking(move || db.get_user_by_username(&username))
            .await
            .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {e}")))??
            .ok_or_else(|| ApiError::Auth("invalid username or password".into()))?
    };

    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| ApiError::Internal(anyhow!("stored hash unparseable: {e}")))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Auth("invalid username or password".into()))?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| ApiError::Internal(anyhow!("corrupt user id '{}': {e}", user.id)))?;

    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
    }))
}

/// Identity probe for an authenticated caller.
pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let user = tokio::task::spawn_blocking(move || db.get_user_by_id(&uid))
        .await
        .map_err(|e| ApiError::Internal(anyhow!("spawn_blocking join error: {e}")))??
        .ok_or_else(|| ApiError::NotFound("user not found".into()))?;

    Ok(Json(user.into_profile()))
}

fn create_token(secret: &str, user_id: Uuid, username: &str) -> ApiResult<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(anyhow!("token encode failed: {e}")))?;

    Ok(token)
}

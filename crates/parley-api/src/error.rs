use axum::{Json, http::StatusCode, response::{IntoResponse, Response}};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use parley_gateway::error::ChatError;

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP-facing error type. Maps the service taxonomy onto status codes and a
/// uniform `{"error": ...}` body; store internals are logged, never returned.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("authentication error: {0}")]
    Auth(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Validation(msg) => ApiError::Validation(msg),
            ChatError::NotFound(msg) => ApiError::NotFound(msg),
            ChatError::Store(inner) => ApiError::Internal(inner),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref inner) = self {
            error!("Internal error: {:#}", inner);
        }
        let body = Json(json!({ "error": self.user_message() }));
        (self.status_code(), body).into_response()
    }
}

use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Failures from the send/read-receipt pipelines.
///
/// An unreachable recipient is deliberately NOT represented here: a message to
/// an offline peer is stored, counted unread, and acked to the sender.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl ChatError {
    /// Message safe to surface to the client. Store internals stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Validation(msg) => msg.clone(),
            ChatError::NotFound(msg) => msg.clone(),
            ChatError::Store(_) => "something went wrong, try again".to_string(),
        }
    }
}

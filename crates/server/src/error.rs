//! Error taxonomy for the chat engine.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ChatError {
    /// Missing, malformed, expired, or revoked credential, or an
    /// inactive user. The connection or request is refused before any
    /// state is created.
    #[error("authentication required")]
    Unauthenticated,

    #[error("chat room not found")]
    RoomNotFound,

    #[error("not a member of this chat room")]
    NotAMember,

    #[error("chat room is full")]
    RoomFull,

    #[error("{0}")]
    BadRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Oracle failures are recovered with fixed fallbacks inside the
    /// risk pipeline and never reach a caller as a failed send.
    #[error("oracle error: {0}")]
    Oracle(String),
}

impl ChatError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        ChatError::BadRequest(msg.into())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ChatError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, "Authentication required".to_string())
            }
            ChatError::RoomNotFound => (StatusCode::NOT_FOUND, "Chat room not found".to_string()),
            ChatError::NotAMember => (
                StatusCode::FORBIDDEN,
                "Access denied to this chat room".to_string(),
            ),
            ChatError::RoomFull => (StatusCode::BAD_REQUEST, "Chat room is full".to_string()),
            ChatError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ChatError::Storage(_) | ChatError::Oracle(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "message": message
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            ChatError::Unauthenticated.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ChatError::RoomNotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ChatError::NotAMember.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ChatError::RoomFull.into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}

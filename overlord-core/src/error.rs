//! Error taxonomy for the session multiplexer (`SPEC_FULL.md`,
//! `[ERROR-HANDLING]`). Kinds map 1:1 onto spec.md §7's named categories.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("request timed out")]
    Timeout,

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already paired: {0}")]
    AlreadyPaired(String),

    #[error("too many outstanding requests")]
    TooManyOutstanding,

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    fn status(&self) -> StatusCode {
        match self {
            CoreError::Io(_) | CoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Protocol(_) => StatusCode::BAD_REQUEST,
            CoreError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            CoreError::AgentNotFound(_) | CoreError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::AlreadyPaired(_) => StatusCode::CONFLICT,
            CoreError::TooManyOutstanding => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Translates a `CoreError` into the standardized `{"status":"error",
/// "data":<message>}` envelope every HTTP/WS response uses (spec.md §7,
/// §9).
impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({ "status": "error", "data": self.to_string() }));
        (status, body).into_response()
    }
}

//! API error types and JSON error response formatting.
//!
//! Errors use the OpenAI-style body `{"error": {"message": ..., "type": ...}}`
//! so chat clients can display them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use dbchat_chat::PipelineError;
use dbchat_core::error::DbChatError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - malformed conversation.
    BadRequest(String),
    /// 500 Internal Server Error - the run failed.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", msg)
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", msg),
        };

        let body = ErrorBody {
            error: ErrorDetail {
                message,
                error_type: error_type.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<DbChatError> for ApiError {
    fn from(err: DbChatError) -> Self {
        match err {
            DbChatError::Conversation(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        tracing::error!(error = %err, "Chat completion failed");
        ApiError::Internal(err.to_string())
    }
}

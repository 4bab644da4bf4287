//! Route handler functions.
//!
//! The chat endpoint normalizes the request into a [`Conversation`], picks a
//! session key and hands the run to the pipeline. Streamed runs are relayed
//! frame by frame as server-sent events.

use std::convert::Infallible;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use dbchat_chat::{aggregate, StreamEncoder};
use dbchat_core::types::{Conversation, Role, SessionKey, StreamChunk, Turn};

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the caller's session key.
pub const SESSION_HEADER: &str = "x-session-id";

const DEFAULT_SESSION: &str = "default";

// =============================================================================
// Request and response types
// =============================================================================

/// One message of a chat-completions request.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl RequestMessage {
    /// Convert to a turn. Roles other than system, user and assistant are
    /// dropped; content parts are joined into plain text.
    fn into_turn(self) -> Option<Turn> {
        let role = match self.role.as_str() {
            "system" | "developer" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                tracing::debug!(role = other, "Skipping message with unsupported role");
                return None;
            }
        };
        let content = match self.content {
            Value::String(text) => text,
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        Some(Turn::new(role, content))
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Option<Vec<RequestMessage>>,
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    pub user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub cached_sessions: usize,
}

// =============================================================================
// Handlers
// =============================================================================

/// Session key from the `X-Session-Id` header, else the request's `user`,
/// else `"default"`.
pub fn session_key(headers: &HeaderMap, user: Option<&str>) -> SessionKey {
    let from_header = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let from_user = user.map(str::trim).filter(|v| !v.is_empty());
    SessionKey::new(from_header.or(from_user).unwrap_or(DEFAULT_SESSION))
}

/// POST /v1/chat/completions - answer a conversation.
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let messages = request
        .messages
        .ok_or_else(|| ApiError::BadRequest("Missing 'messages' array".to_string()))?;
    let turns = messages
        .into_iter()
        .filter_map(RequestMessage::into_turn)
        .collect();
    let conversation = Conversation::normalize(turns, state.pipeline.system_prompt())?;
    let session = session_key(&headers, request.user.as_deref());
    let model = request.model.unwrap_or_else(|| state.model.clone());

    tracing::info!(
        session = %session,
        stream = request.stream,
        turns = conversation.len(),
        "Chat completion request"
    );

    if request.stream {
        let chunks = state
            .pipeline
            .stream(conversation, session, state.stream_capacity);
        let events = relay_events(chunks, state.stream_capacity);
        return Ok(Sse::new(events).into_response());
    }

    let chunks = state.pipeline.complete(&conversation, &session).await?;
    let completion = aggregate(chunks, &model)?;
    Ok(Json(completion).into_response())
}

/// Encode pipeline chunks into SSE events on a background task.
///
/// When the client disconnects the event receiver is dropped, the relay
/// stops, and dropping `chunks` cancels the pipeline run.
fn relay_events(
    mut chunks: mpsc::Receiver<StreamChunk>,
    capacity: usize,
) -> ReceiverStream<Result<Event, Infallible>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let mut encoder = StreamEncoder::new();
        while let Some(chunk) = chunks.recv().await {
            let frames = match encoder.encode(&chunk) {
                Ok(frames) => frames,
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping chunk after end of stream");
                    break;
                }
            };
            for frame in frames {
                if tx.send(Ok(Event::default().data(frame.data()))).await.is_err() {
                    tracing::debug!("Client disconnected mid-stream");
                    return;
                }
            }
            if encoder.is_finished() {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

/// GET / - liveness text.
pub async fn index() -> impl IntoResponse {
    "dbchat is running"
}

/// GET /health - health check.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        cached_sessions: state.pipeline.cache().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_session_key_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_key(&headers, None).as_str(), "default");
        assert_eq!(session_key(&headers, Some("alice")).as_str(), "alice");
        assert_eq!(session_key(&headers, Some("  ")).as_str(), "default");

        headers.insert(SESSION_HEADER, HeaderValue::from_static("thread-7"));
        assert_eq!(session_key(&headers, Some("alice")).as_str(), "thread-7");
    }

    #[test]
    fn test_message_content_parts_are_joined() {
        let message: RequestMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [{"type": "text", "text": "top"}, {"type": "text", "text": "regions"}]
        }))
        .unwrap();
        let turn = message.into_turn().unwrap();
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, "top\nregions");
    }

    #[test]
    fn test_unsupported_roles_are_skipped() {
        let message: RequestMessage =
            serde_json::from_value(json!({"role": "tool", "content": "{}"})).unwrap();
        assert!(message.into_turn().is_none());
        let message: RequestMessage =
            serde_json::from_value(json!({"role": "developer", "content": "be brief"})).unwrap();
        assert_eq!(message.into_turn().unwrap().role, Role::System);
    }

    #[tokio::test]
    async fn test_relay_emits_done_once_and_stops() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamChunk::content("a")).await.unwrap();
        tx.send(StreamChunk::terminal()).await.unwrap();
        tx.send(StreamChunk::content("late")).await.unwrap();
        drop(tx);

        let mut events = relay_events(rx, 8).into_inner();
        let mut count = 0;
        while events.recv().await.is_some() {
            count += 1;
        }
        // content frame, stop frame, [DONE]
        assert_eq!(count, 3);
    }
}

//! HTTP surface for dbchat.
//!
//! Serves an OpenAI-compatible `POST /v1/chat/completions` endpoint,
//! streamed as server-sent events or returned as one completion object,
//! plus liveness and health routes.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;

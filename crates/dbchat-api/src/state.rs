//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use dbchat_chat::QueryPipeline;

/// Default capacity of the chunk channel behind each streamed response.
pub const DEFAULT_STREAM_CAPACITY: usize = 64;

/// Shared application state.
///
/// Cloned into every handler task; all fields are cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// The orchestration pipeline, holding the oracle, store and cache.
    pub pipeline: Arc<QueryPipeline>,
    /// Model name echoed in responses when the request names none.
    pub model: String,
    /// Bound of the per-response chunk channel.
    pub stream_capacity: usize,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(pipeline: QueryPipeline, model: impl Into<String>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            model: model.into(),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            start_time: Instant::now(),
        }
    }
}

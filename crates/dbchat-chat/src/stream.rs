//! Wire encoding of pipeline output.
//!
//! Streaming responses are OpenAI-style server-sent events: one
//! `chat.completion.chunk` frame per chunk, then a stop frame and a literal
//! `[DONE]` marker. Buffered responses fold every chunk into a single
//! `chat.completion` object.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use dbchat_core::types::{StreamChunk, ToolCall};

use crate::error::PipelineError;

pub const DONE_MARKER: &str = "[DONE]";

// =============================================================================
// Streaming frames
// =============================================================================

#[derive(Serialize)]
struct FrameBody<'a> {
    choices: [FrameChoice<'a>; 1],
}

#[derive(Serialize)]
struct FrameChoice<'a> {
    delta: FrameDelta<'a>,
    index: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    finish_reason: Option<&'static str>,
}

#[derive(Serialize)]
struct FrameDelta<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<&'a [ToolCall]>,
}

/// One server-sent event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Data(String),
    Done,
}

impl WireFrame {
    /// The `data:` field value.
    pub fn data(&self) -> &str {
        match self {
            WireFrame::Data(json) => json,
            WireFrame::Done => DONE_MARKER,
        }
    }

    /// Full event text, including the blank-line terminator.
    pub fn encode(&self) -> String {
        format!("data: {}\n\n", self.data())
    }
}

/// Turns pipeline chunks into wire frames for one response.
#[derive(Debug, Default)]
pub struct StreamEncoder {
    finished: bool,
}

impl StreamEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Frames for `chunk`, in order. The terminal chunk yields the stop
    /// frame followed by [`WireFrame::Done`].
    pub fn encode(&mut self, chunk: &StreamChunk) -> Result<Vec<WireFrame>, PipelineError> {
        if self.finished {
            return Err(PipelineError::Protocol(
                "frame written after the done marker".to_string(),
            ));
        }

        let mut frames = Vec::with_capacity(2);
        if chunk.content_delta.is_some() || chunk.tool_call.is_some() {
            let delta = FrameDelta {
                content: chunk.content_delta.as_deref(),
                tool_calls: chunk.tool_call.as_ref().map(std::slice::from_ref),
            };
            frames.push(frame(delta, None)?);
        }
        if chunk.terminal {
            self.finished = true;
            frames.push(frame(
                FrameDelta {
                    content: None,
                    tool_calls: None,
                },
                Some("stop"),
            )?);
            frames.push(WireFrame::Done);
        }
        Ok(frames)
    }
}

fn frame(
    delta: FrameDelta<'_>,
    finish_reason: Option<&'static str>,
) -> Result<WireFrame, PipelineError> {
    let body = FrameBody {
        choices: [FrameChoice {
            delta,
            index: 0,
            finish_reason,
        }],
    };
    serde_json::to_string(&body)
        .map(WireFrame::Data)
        .map_err(|e| PipelineError::Protocol(format!("unencodable frame: {}", e)))
}

// =============================================================================
// Aggregated response
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

/// A non-streamed `chat.completion` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

/// Folds chunks into one [`ChatCompletion`].
#[derive(Debug, Default)]
pub struct CompletionAggregator {
    content: Option<String>,
    tool_calls: Vec<ToolCall>,
    finished: bool,
}

impl CompletionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: StreamChunk) -> Result<(), PipelineError> {
        if self.finished {
            return Err(PipelineError::Protocol(
                "chunk received after the terminal marker".to_string(),
            ));
        }
        if let Some(delta) = chunk.content_delta {
            self.content.get_or_insert_with(String::new).push_str(&delta);
        }
        if let Some(call) = chunk.tool_call {
            self.tool_calls.push(call);
        }
        self.finished = chunk.terminal;
        Ok(())
    }

    pub fn finish(self, model: &str) -> ChatCompletion {
        ChatCompletion {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: self.content,
                    tool_calls: self.tool_calls,
                },
                finish_reason: "stop".to_string(),
            }],
        }
    }
}

/// Aggregate a finished run's chunks.
pub fn aggregate(
    chunks: impl IntoIterator<Item = StreamChunk>,
    model: &str,
) -> Result<ChatCompletion, PipelineError> {
    let mut aggregator = CompletionAggregator::new();
    for chunk in chunks {
        aggregator.push(chunk)?;
    }
    Ok(aggregator.finish(model))
}

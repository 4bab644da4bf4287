//! Destination of pipeline output.
//!
//! A streaming sink forwards chunks over a bounded channel to the
//! transport; a buffered sink collects them for one aggregated response.
//! Either way, nothing may follow the terminal chunk.

use tokio::sync::mpsc;

use dbchat_core::types::{StreamChunk, ToolCall};

use crate::error::PipelineError;

enum Target {
    Channel(mpsc::Sender<StreamChunk>),
    Buffer(Vec<StreamChunk>),
}

pub struct ChunkSink {
    target: Target,
    terminated: bool,
}

impl ChunkSink {
    /// A streaming sink and the receiver the transport reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::streaming(tx), rx)
    }

    pub fn streaming(tx: mpsc::Sender<StreamChunk>) -> Self {
        Self {
            target: Target::Channel(tx),
            terminated: false,
        }
    }

    pub fn buffered() -> Self {
        Self {
            target: Target::Buffer(Vec::new()),
            terminated: false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.target, Target::Channel(_))
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        match &self.target {
            Target::Channel(tx) => tx.is_closed(),
            Target::Buffer(_) => false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub async fn emit(&mut self, chunk: StreamChunk) -> Result<(), PipelineError> {
        if self.terminated {
            return Err(PipelineError::Protocol(
                "chunk emitted after the terminal marker".to_string(),
            ));
        }
        self.terminated = chunk.terminal;
        match &mut self.target {
            Target::Channel(tx) => tx.send(chunk).await.map_err(|_| {
                PipelineError::Protocol("response stream closed by the client".to_string())
            }),
            Target::Buffer(chunks) => {
                chunks.push(chunk);
                Ok(())
            }
        }
    }

    pub async fn content(&mut self, text: impl Into<String>) -> Result<(), PipelineError> {
        self.emit(StreamChunk::content(text)).await
    }

    pub async fn tool(&mut self, call: ToolCall) -> Result<(), PipelineError> {
        self.emit(StreamChunk::tool(call)).await
    }

    /// Emit the terminal chunk.
    pub async fn finish(&mut self) -> Result<(), PipelineError> {
        self.emit(StreamChunk::terminal()).await
    }

    /// Chunks collected by a buffered sink; empty for a streaming one.
    pub fn into_chunks(self) -> Vec<StreamChunk> {
        match self.target {
            Target::Buffer(chunks) => chunks,
            Target::Channel(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_collects_in_order() {
        let mut sink = ChunkSink::buffered();
        sink.content("a").await.unwrap();
        sink.content("b").await.unwrap();
        sink.finish().await.unwrap();
        let chunks = sink.into_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].content_delta.as_deref(), Some("b"));
        assert!(chunks[2].terminal);
    }

    #[tokio::test]
    async fn test_emit_after_terminal_is_protocol_error() {
        let mut sink = ChunkSink::buffered();
        sink.finish().await.unwrap();
        let err = sink.content("late").await.unwrap_err();
        assert!(matches!(err, PipelineError::Protocol(_)));
        assert_eq!(sink.into_chunks().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_is_protocol_error() {
        let (mut sink, rx) = ChunkSink::channel(4);
        assert!(sink.is_streaming());
        assert!(!sink.is_closed());
        drop(rx);
        assert!(sink.is_closed());
        let err = sink.content("lost").await.unwrap_err();
        assert!(matches!(err, PipelineError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_channel_delivers() {
        let (mut sink, mut rx) = ChunkSink::channel(4);
        sink.content("hi").await.unwrap();
        sink.finish().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().content_delta.as_deref(), Some("hi"));
        assert!(rx.recv().await.unwrap().terminal);
    }
}

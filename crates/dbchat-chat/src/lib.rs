//! Chat orchestration for dbchat.
//!
//! Turns a conversation into a streamed answer: classifies the request,
//! asks the oracle for a query, runs it against the data store, summarises
//! the result and offers or renders a chart.

pub mod cache;
pub mod error;
pub mod format;
pub mod oracle;
pub mod pipeline;
pub mod sink;
pub mod stream;

pub use cache::{SessionCache, SessionEntry};
pub use error::{OracleError, PipelineError};
pub use oracle::{OpenAiOracle, Oracle};
pub use pipeline::{PipelineSettings, QueryPipeline, Stage};
pub use sink::ChunkSink;
pub use stream::{aggregate, ChatCompletion, StreamEncoder, WireFrame};

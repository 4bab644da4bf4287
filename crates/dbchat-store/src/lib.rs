//! Data store seam for dbchat.
//!
//! Defines the [`DataStore`] trait the pipeline executes parsed queries
//! against, plus [`MemoryStore`], a document store that evaluates the
//! supported find / countDocuments / aggregate subset over JSON loaded
//! from disk.

pub mod aggregate;
pub mod error;
pub mod matcher;
pub mod memory;

use async_trait::async_trait;

use dbchat_core::types::{CollectionSample, QueryResult};
use dbchat_query::ParsedQuery;

pub use error::DataStoreError;
pub use memory::MemoryStore;

/// A database the pipeline can run queries against.
///
/// Implementations must be cheap to share; the pipeline holds one behind an
/// `Arc` and calls it from concurrent requests.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Database kind as presented to the oracle, e.g. "mongodb".
    fn kind(&self) -> &str;

    /// Execute a parsed query.
    async fn execute(&self, query: &ParsedQuery) -> Result<QueryResult, DataStoreError>;

    /// Up to `per_collection` documents from every collection, for
    /// describing the database.
    async fn sample(&self, per_collection: usize) -> Result<Vec<CollectionSample>, DataStoreError>;
}

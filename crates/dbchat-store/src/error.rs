//! Error types for query execution.

use dbchat_core::error::DbChatError;

/// Errors from executing a query against a data store.
#[derive(Debug, thiserror::Error)]
pub enum DataStoreError {
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
    #[error("Failed to load collection {collection}: {reason}")]
    Load { collection: String, reason: String },
    #[error("Data store unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DataStoreError> for DbChatError {
    fn from(err: DataStoreError) -> Self {
        DbChatError::Store(err.to_string())
    }
}

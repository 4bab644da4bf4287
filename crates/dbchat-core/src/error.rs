use thiserror::Error;

/// Top-level error type for dbchat.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for DbChatError` so that the `?` operator works
/// across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DbChatError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid conversation: {0}")]
    Conversation(String),

    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Data store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for DbChatError {
    fn from(err: toml::de::Error) -> Self {
        DbChatError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for DbChatError {
    fn from(err: toml::ser::Error) -> Self {
        DbChatError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DbChatError {
    fn from(err: serde_json::Error) -> Self {
        DbChatError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for dbchat operations.
pub type Result<T> = std::result::Result<T, DbChatError>;

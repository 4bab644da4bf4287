//! Error types for the orchestration pipeline.

use dbchat_core::error::DbChatError;

/// Errors from the language-model oracle.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(String),
    #[error("oracle request timed out")]
    Timeout,
    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("oracle returned malformed output: {0}")]
    Malformed(String),
    #[error("API key not set: environment variable {0} is empty")]
    MissingApiKey(String),
}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OracleError::Timeout
        } else {
            OracleError::Request(err.to_string())
        }
    }
}

/// Errors that abort a pipeline run.
///
/// Parse and data store failures are not here: they are rendered to the
/// user inside the run and never escape it.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("generated chart is invalid: {0}")]
    Validation(String),
    #[error("stream protocol violation: {0}")]
    Protocol(String),
    #[error("invalid stage transition: {0} -> {1}")]
    InvalidTransition(crate::pipeline::Stage, crate::pipeline::Stage),
}

impl From<OracleError> for DbChatError {
    fn from(err: OracleError) -> Self {
        DbChatError::Oracle(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;

    #[test]
    fn test_oracle_error_display() {
        assert_eq!(OracleError::Timeout.to_string(), "oracle request timed out");
        let err = OracleError::Status {
            status: 429,
            body: "rate limited".into(),
        };
        assert_eq!(err.to_string(), "oracle returned HTTP 429: rate limited");
        assert!(OracleError::MissingApiKey("OPENAI_API_KEY".into())
            .to_string()
            .contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_pipeline_error_wraps_oracle_transparently() {
        let err: PipelineError = OracleError::Malformed("not json".into()).into();
        assert!(matches!(err, PipelineError::Oracle(_)));
        assert_eq!(err.to_string(), "oracle returned malformed output: not json");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = PipelineError::InvalidTransition(Stage::Done, Stage::Received);
        assert_eq!(err.to_string(), "invalid stage transition: done -> received");
    }

    #[test]
    fn test_oracle_error_into_core_error() {
        let err: DbChatError = OracleError::Timeout.into();
        assert!(matches!(err, DbChatError::Oracle(_)));
    }
}

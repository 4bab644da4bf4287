//! The language-model oracle seam.
//!
//! [`Oracle`] covers every natural-language judgement the pipeline needs.
//! The helpers here turn raw completion text into typed answers and are
//! shared by every implementation.

pub mod openai;

use async_trait::async_trait;
use serde_json::Value;

use dbchat_core::types::{ChartType, CollectionSample, Conversation, Interpretation};

use crate::error::OracleError;

pub use openai::OpenAiOracle;

/// Natural-language reasoning service.
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Turn the conversation into an intent, a query and its reasoning.
    async fn interpret(&self, conversation: &Conversation) -> Result<Interpretation, OracleError>;

    /// Whether the conversation needs a database query to answer.
    async fn classify(&self, conversation: &Conversation) -> Result<bool, OracleError>;

    /// Whether the latest user turn confirms a previously offered chart.
    async fn confirm_chart(&self, conversation: &Conversation) -> Result<bool, OracleError>;

    /// Explain a query result in plain language.
    async fn summarize(
        &self,
        question: &str,
        query_text: &str,
        result_sample: &[Value],
        system_prompt: &str,
    ) -> Result<String, OracleError>;

    /// Suggest a chart type for a result, or `None`.
    async fn advise_chart(
        &self,
        query_text: &str,
        result_sample: &[Value],
    ) -> Result<Option<ChartType>, OracleError>;

    /// Produce a chart configuration as raw text (JSON, possibly fenced).
    async fn generate_chart(
        &self,
        query_text: &str,
        result: &Value,
        chart_type: Option<ChartType>,
    ) -> Result<String, OracleError>;

    /// Open-ended reply to the conversation.
    async fn reply(&self, conversation: &Conversation) -> Result<String, OracleError>;

    /// Describe a database from collection samples, for the system prompt.
    async fn describe_database(
        &self,
        db_kind: &str,
        samples: &[CollectionSample],
    ) -> Result<String, OracleError>;
}

// =============================================================================
// Answer parsing
// =============================================================================

/// Remove a surrounding ```` ``` ```` / ```` ```json ```` fence, if present.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening line.
    let body = match rest.find('\n') {
        Some(newline) if rest[..newline].chars().all(|c| c.is_ascii_alphanumeric()) => {
            &rest[newline + 1..]
        }
        _ => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

/// Interpret a YES/NO classifier answer. Anything but "yes" is false.
pub fn parse_yes_no(text: &str) -> bool {
    let answer = text
        .trim()
        .trim_end_matches(|c: char| c == '.' || c == '!')
        .to_ascii_uppercase();
    answer == "YES"
}

/// Interpret a `{"confirmChart": bool}` answer. Unparseable answers count
/// as "not confirmed".
pub fn parse_confirm_chart(text: &str) -> bool {
    match serde_json::from_str::<Value>(strip_code_fence(text)) {
        Ok(value) => value.get("confirmChart") == Some(&Value::Bool(true)),
        Err(e) => {
            tracing::warn!(error = %e, raw = %text, "Chart confirmation answer was not JSON");
            false
        }
    }
}

/// Parse an interpretation object.
pub fn parse_interpretation(text: &str) -> Result<Interpretation, OracleError> {
    serde_json::from_str(strip_code_fence(text))
        .map_err(|e| OracleError::Malformed(format!("interpretation: {}", e)))
}

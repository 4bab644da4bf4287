use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DbChatError, Result};

// =============================================================================
// Conversation
// =============================================================================

/// Author of a conversation turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single conversation turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// An ordered conversation with exactly one leading system turn and at
/// least one user turn.
///
/// Built once per request through [`Conversation::normalize`] and never
/// mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Normalize caller-supplied turns.
    ///
    /// Without any system turn, `system_prompt` is prepended. Otherwise all
    /// system turns are folded, in order, into a single leading turn.
    pub fn normalize(turns: Vec<Turn>, system_prompt: &SystemPrompt) -> Result<Self> {
        if turns.is_empty() {
            return Err(DbChatError::Conversation(
                "Missing 'messages' array".to_string(),
            ));
        }
        if !turns.iter().any(|t| t.role == Role::User) {
            return Err(DbChatError::Conversation(
                "No user message found.".to_string(),
            ));
        }

        let (system, rest): (Vec<Turn>, Vec<Turn>) =
            turns.into_iter().partition(|t| t.role == Role::System);

        let leading = if system.is_empty() {
            Turn::system(system_prompt.as_str())
        } else {
            let joined = system
                .into_iter()
                .map(|t| t.content)
                .collect::<Vec<_>>()
                .join("\n\n");
            Turn::system(joined)
        };

        let mut normalized = Vec::with_capacity(rest.len() + 1);
        normalized.push(leading);
        normalized.extend(rest);
        Ok(Self { turns: normalized })
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Content of the leading system turn.
    pub fn system_prompt(&self) -> &str {
        &self.turns[0].content
    }

    /// Content of the most recent user turn.
    pub fn latest_user_turn(&self) -> &str {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// The immutable system prompt describing the database, built once at
/// startup and shared by every pipeline run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemPrompt(Arc<str>);

impl SystemPrompt {
    /// Build the prompt from a database description and the store kind.
    pub fn new(description: &str, db_kind: &str) -> Self {
        Self(Arc::from(format!(
            "{}\nThis is a {} database.",
            description.trim_end(),
            db_kind
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SystemPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a conversation thread.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Oracle outputs
// =============================================================================

/// The oracle's reading of a conversation that needs a database query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interpretation {
    pub intent: String,
    #[serde(rename = "query", alias = "queryText")]
    pub query_text: String,
    pub reasoning: String,
}

/// Chart families the advisor may suggest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Scatter,
}

impl ChartType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartType::Bar => "bar",
            ChartType::Line => "line",
            ChartType::Pie => "pie",
            ChartType::Scatter => "scatter",
        }
    }

    /// Read a one-word advisor answer. `"none"` and anything unrecognised
    /// mean no chart.
    pub fn from_suggestion(raw: &str) -> Option<Self> {
        let word = raw
            .trim()
            .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
            .to_lowercase();
        match word.as_str() {
            "bar" => Some(ChartType::Bar),
            "line" => Some(ChartType::Line),
            "pie" => Some(ChartType::Pie),
            "scatter" => Some(ChartType::Scatter),
            _ => None,
        }
    }
}

impl fmt::Display for ChartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured chart configuration rendered by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    #[serde(rename = "type")]
    pub chart_type: String,
    pub data: Value,
    pub options: Value,
}

// =============================================================================
// Query results
// =============================================================================

/// Result of executing a parsed query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryResult {
    Rows(Vec<Value>),
    Scalar(i64),
    Empty,
}

impl QueryResult {
    /// Wrap rows, mapping an empty row set to [`QueryResult::Empty`].
    pub fn from_rows(rows: Vec<Value>) -> Self {
        if rows.is_empty() {
            QueryResult::Empty
        } else {
            QueryResult::Rows(rows)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            QueryResult::Rows(rows) => rows.is_empty(),
            QueryResult::Scalar(_) => false,
            QueryResult::Empty => true,
        }
    }

    /// Number of rows, counting a scalar as one.
    pub fn row_count(&self) -> usize {
        match self {
            QueryResult::Rows(rows) => rows.len(),
            QueryResult::Scalar(_) => 1,
            QueryResult::Empty => 0,
        }
    }

    /// The first `n` records; a scalar yields itself.
    pub fn sample(&self, n: usize) -> Vec<Value> {
        match self {
            QueryResult::Rows(rows) => rows.iter().take(n).cloned().collect(),
            QueryResult::Scalar(v) => vec![Value::from(*v)],
            QueryResult::Empty => Vec::new(),
        }
    }

    /// Plain JSON view used in prompts and rendered answers.
    pub fn to_json(&self) -> Value {
        match self {
            QueryResult::Rows(rows) => Value::Array(rows.clone()),
            QueryResult::Scalar(v) => Value::from(*v),
            QueryResult::Empty => Value::Array(Vec::new()),
        }
    }
}

/// A handful of documents from one collection, used to describe the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionSample {
    pub name: String,
    #[serde(rename = "sampleDocuments")]
    pub documents: Vec<Value>,
}

// =============================================================================
// Streaming output
// =============================================================================

/// Function payload of a tool call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// A tool invocation handed to the client (charts only).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub index: u32,
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolFunction,
}

impl ToolCall {
    /// Build the `chart_renderer` call for a chart spec.
    pub fn chart(spec: &ChartSpec) -> Result<Self> {
        Ok(Self {
            index: 0,
            id: "tool_call_chart_1".to_string(),
            call_type: "function".to_string(),
            function: ToolFunction {
                name: "chart_renderer".to_string(),
                arguments: serde_json::to_string(spec)?,
            },
        })
    }
}

/// One unit of pipeline output, in emission order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content_delta: Option<String>,
    pub tool_call: Option<ToolCall>,
    pub terminal: bool,
}

impl StreamChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content_delta: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn tool(call: ToolCall) -> Self {
        Self {
            tool_call: Some(call),
            ..Self::default()
        }
    }

    pub fn terminal() -> Self {
        Self {
            terminal: true,
            ..Self::default()
        }
    }
}

//! The orchestration pipeline.
//!
//! One run per request, moving through validated stages:
//! Received -> ChartConfirmCheck -> ChartBranch | ClassifyBranch
//! ClassifyBranch -> PlainBranch | QueryBranch
//! Branch -> Responding -> Done, with Error reachable from any live stage.
//!
//! Runs are linear and never retried. Before every oracle or store call the
//! sink is checked, so a client that hangs up stops the run early.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::Instrument;

use dbchat_core::config::{PipelineConfig, ResponseSections};
use dbchat_core::types::{
    ChartSpec, ChartType, Conversation, SessionKey, StreamChunk, SystemPrompt, ToolCall,
};
use dbchat_store::DataStore;

use crate::cache::{SessionCache, SessionEntry};
use crate::error::PipelineError;
use crate::format;
use crate::oracle::{strip_code_fence, Oracle};
use crate::sink::ChunkSink;

// =============================================================================
// Stages
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Received,
    ChartConfirmCheck,
    ChartBranch,
    ClassifyBranch,
    PlainBranch,
    QueryBranch,
    Responding,
    Done,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::ChartConfirmCheck => "chart_confirm_check",
            Stage::ChartBranch => "chart_branch",
            Stage::ClassifyBranch => "classify_branch",
            Stage::PlainBranch => "plain_branch",
            Stage::QueryBranch => "query_branch",
            Stage::Responding => "responding",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validate that a stage transition is allowed.
///
/// Every stage except `Done` and `Error` may also move to `Error`.
pub fn validate_transition(from: Stage, to: Stage) -> Result<(), PipelineError> {
    let valid = matches!(
        (from, to),
        (Stage::Received, Stage::ChartConfirmCheck)
            | (Stage::ChartConfirmCheck, Stage::ChartBranch)
            | (Stage::ChartConfirmCheck, Stage::ClassifyBranch)
            | (Stage::ClassifyBranch, Stage::PlainBranch)
            | (Stage::ClassifyBranch, Stage::QueryBranch)
            | (Stage::ChartBranch, Stage::Responding)
            | (Stage::PlainBranch, Stage::Responding)
            | (Stage::QueryBranch, Stage::Responding)
            | (Stage::Responding, Stage::Done)
    ) || (to == Stage::Error && !matches!(from, Stage::Done | Stage::Error));

    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidTransition(from, to))
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Runtime form of [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub enable_charts: bool,
    pub pacing: Duration,
    pub announce_thinking: bool,
    pub summary_sample_rows: usize,
    pub chart_sample_rows: usize,
    pub sections: ResponseSections,
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            enable_charts: config.enable_charts,
            pacing: Duration::from_millis(config.stream_pacing_ms),
            announce_thinking: config.announce_thinking,
            summary_sample_rows: config.summary_sample_rows,
            chart_sample_rows: config.chart_sample_rows,
            sections: config.response_sections.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Answers chat requests from the oracle, the data store and the session
/// cache.
pub struct QueryPipeline {
    oracle: Arc<dyn Oracle>,
    store: Arc<dyn DataStore>,
    cache: Arc<SessionCache>,
    settings: PipelineSettings,
    system_prompt: SystemPrompt,
}

impl QueryPipeline {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        store: Arc<dyn DataStore>,
        cache: Arc<SessionCache>,
        settings: PipelineSettings,
        system_prompt: SystemPrompt,
    ) -> Self {
        Self {
            oracle,
            store,
            cache,
            settings,
            system_prompt,
        }
    }

    pub fn system_prompt(&self) -> &SystemPrompt {
        &self.system_prompt
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Start a streaming run in the background and return its chunks.
    ///
    /// Dropping the receiver cancels the run before its next stage.
    pub fn stream(
        self: &Arc<Self>,
        conversation: Conversation,
        session: SessionKey,
        capacity: usize,
    ) -> mpsc::Receiver<StreamChunk> {
        let (mut sink, rx) = ChunkSink::channel(capacity);
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pipeline.execute(&conversation, &session, &mut sink).await {
                tracing::debug!(error = %e, "Streaming run ended early");
            }
        });
        rx
    }

    /// Run to completion and return every chunk, for an aggregated answer.
    pub async fn complete(
        &self,
        conversation: &Conversation,
        session: &SessionKey,
    ) -> Result<Vec<StreamChunk>, PipelineError> {
        let mut sink = ChunkSink::buffered();
        self.execute(conversation, session, &mut sink).await?;
        Ok(sink.into_chunks())
    }

    /// Run one request against `sink`.
    ///
    /// On success the sink ends with the terminal chunk. A streaming sink
    /// also gets an error chunk and the terminal chunk when the run fails;
    /// a buffered sink gets nothing more and the error is returned. Protocol
    /// errors are always returned, since the client is gone.
    pub async fn execute(
        &self,
        conversation: &Conversation,
        session: &SessionKey,
        sink: &mut ChunkSink,
    ) -> Result<(), PipelineError> {
        let span = tracing::info_span!(
            "pipeline",
            session = %session,
            streaming = sink.is_streaming(),
            branch = tracing::field::Empty,
        );

        async move {
            let mut run = Run {
                pipeline: self,
                conversation,
                session,
                sink,
                stage: Stage::Received,
            };

            let err = match run.drive().await {
                Ok(()) => {
                    run.advance(Stage::Done)?;
                    return run.sink.finish().await;
                }
                Err(err) => err,
            };

            if run.advance(Stage::Error).is_err() {
                tracing::warn!(stage = %run.stage, "Run failed after completion");
            }
            match err {
                PipelineError::Protocol(_) => {
                    tracing::info!(error = %err, "Client went away; run cancelled");
                    Err(err)
                }
                _ if run.sink.is_streaming() && !run.sink.is_terminated() => {
                    tracing::error!(error = %err, "Pipeline run failed");
                    run.sink.content(format::error(&err)).await?;
                    run.sink.finish().await
                }
                _ => {
                    tracing::error!(error = %err, "Pipeline run failed");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// What the branch decided to send in the Responding stage.
enum Outcome {
    Content(Vec<String>),
    /// Word chunks sent with the configured pacing between them.
    Paced(Vec<String>),
    Tool(ToolCall),
}

struct Run<'a> {
    pipeline: &'a QueryPipeline,
    conversation: &'a Conversation,
    session: &'a SessionKey,
    sink: &'a mut ChunkSink,
    stage: Stage,
}

impl Run<'_> {
    fn advance(&mut self, to: Stage) -> Result<(), PipelineError> {
        validate_transition(self.stage, to)?;
        tracing::debug!(from = %self.stage, to = %to, "Stage transition");
        if matches!(
            to,
            Stage::ChartBranch | Stage::PlainBranch | Stage::QueryBranch
        ) {
            tracing::Span::current().record("branch", to.as_str());
        }
        self.stage = to;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), PipelineError> {
        if self.sink.is_closed() {
            return Err(PipelineError::Protocol(
                "response stream closed by the client".to_string(),
            ));
        }
        Ok(())
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        let pipeline = self.pipeline;
        if self.sink.is_streaming() && pipeline.settings.announce_thinking {
            self.sink.content(format::THINKING).await?;
        }

        self.advance(Stage::ChartConfirmCheck)?;
        let outcome = match self.confirmed_chart().await? {
            Some(entry) => {
                self.advance(Stage::ChartBranch)?;
                self.chart_branch(&entry).await?
            }
            None => {
                self.advance(Stage::ClassifyBranch)?;
                self.ensure_open()?;
                if pipeline.oracle.classify(self.conversation).await? {
                    self.advance(Stage::QueryBranch)?;
                    self.query_branch().await?
                } else {
                    self.advance(Stage::PlainBranch)?;
                    self.plain_branch().await?
                }
            }
        };

        self.advance(Stage::Responding)?;
        self.respond(outcome).await
    }

    /// The cached entry when the user is confirming an offered chart.
    async fn confirmed_chart(&mut self) -> Result<Option<Arc<SessionEntry>>, PipelineError> {
        let pipeline = self.pipeline;
        if !pipeline.settings.enable_charts {
            return Ok(None);
        }
        let Some(entry) = pipeline.cache.get(self.session) else {
            return Ok(None);
        };
        if entry.result.is_empty() {
            return Ok(None);
        }

        self.ensure_open()?;
        let confirmed = pipeline.oracle.confirm_chart(self.conversation).await?;
        tracing::debug!(confirmed, "Chart confirmation checked");
        Ok(confirmed.then_some(entry))
    }

    async fn chart_branch(&mut self, entry: &SessionEntry) -> Result<Outcome, PipelineError> {
        self.ensure_open()?;
        let raw = self
            .pipeline
            .oracle
            .generate_chart(
                &entry.query_text,
                &entry.result.to_json(),
                entry.suggested_chart_type,
            )
            .await?;
        let spec = parse_chart_spec(&raw, entry.suggested_chart_type)?;
        let call =
            ToolCall::chart(&spec).map_err(|e| PipelineError::Validation(e.to_string()))?;
        tracing::info!(chart_type = %spec.chart_type, "Chart generated");
        Ok(Outcome::Tool(call))
    }

    async fn plain_branch(&mut self) -> Result<Outcome, PipelineError> {
        self.ensure_open()?;
        let reply = self.pipeline.oracle.reply(self.conversation).await?;
        if self.sink.is_streaming() {
            Ok(Outcome::Paced(format::words(&reply)))
        } else {
            Ok(Outcome::Content(vec![reply]))
        }
    }

    async fn query_branch(&mut self) -> Result<Outcome, PipelineError> {
        let pipeline = self.pipeline;
        let settings = &pipeline.settings;
        let sections = &settings.sections;

        self.ensure_open()?;
        let interpretation = pipeline.oracle.interpret(self.conversation).await?;
        tracing::info!(
            intent = %interpretation.intent,
            query = %interpretation.query_text,
            "Query interpreted"
        );
        if sections.intent {
            self.sink.content(format::intent(&interpretation.intent)).await?;
        }
        if sections.reasoning {
            self.sink
                .content(format::reasoning(&interpretation.reasoning))
                .await?;
        }
        if sections.query {
            self.sink
                .content(format::query(&interpretation.query_text))
                .await?;
        }

        let parsed = match dbchat_query::parse(&interpretation.query_text) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(error = %e, "Generated query rejected");
                return Ok(Outcome::Content(vec![format::database_error(&e)]));
            }
        };

        self.ensure_open()?;
        let result = match pipeline.store.execute(&parsed).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, collection = %parsed.collection, "Query execution failed");
                return Ok(Outcome::Content(vec![format::database_error(&e)]));
            }
        };
        if result.is_empty() {
            tracing::info!(collection = %parsed.collection, "Query matched no records");
            return Ok(Outcome::Content(vec![format::NO_RECORDS.to_string()]));
        }
        if sections.result {
            self.sink.content(format::result(&result)).await?;
        }

        let mut parts = Vec::new();
        if sections.summary {
            self.ensure_open()?;
            let summary = pipeline
                .oracle
                .summarize(
                    self.conversation.latest_user_turn(),
                    &interpretation.query_text,
                    &result.sample(settings.summary_sample_rows),
                    self.conversation.system_prompt(),
                )
                .await?;
            parts.push(format::summary(&summary));
        }

        let chart_type = if settings.enable_charts {
            self.ensure_open()?;
            pipeline
                .oracle
                .advise_chart(
                    &interpretation.query_text,
                    &result.sample(settings.chart_sample_rows),
                )
                .await?
        } else {
            None
        };
        if let (Some(chart_type), true) = (chart_type, sections.chart_suggestion) {
            parts.push(format::chart_offer(chart_type));
        }

        tracing::debug!(rows = result.row_count(), chart = ?chart_type, "Caching session result");
        pipeline.cache.set(
            self.session.clone(),
            SessionEntry::new(interpretation.query_text, result, chart_type),
        );
        Ok(Outcome::Content(parts))
    }

    async fn respond(&mut self, outcome: Outcome) -> Result<(), PipelineError> {
        match outcome {
            Outcome::Content(parts) => {
                for part in parts {
                    self.sink.content(part).await?;
                }
            }
            Outcome::Paced(words) => {
                let pacing = self.pipeline.settings.pacing;
                for (i, word) in words.into_iter().enumerate() {
                    if i > 0 && !pacing.is_zero() {
                        tokio::time::sleep(pacing).await;
                    }
                    self.sink.content(word).await?;
                }
            }
            Outcome::Tool(call) => self.sink.tool(call).await?,
        }
        Ok(())
    }
}

/// Read a generated chart configuration.
///
/// The chart type comes from the configuration, then the advisor's
/// suggestion, then `bar`.
pub fn parse_chart_spec(raw: &str, suggested: Option<ChartType>) -> Result<ChartSpec, PipelineError> {
    let value: Value = serde_json::from_str(strip_code_fence(raw))
        .map_err(|e| PipelineError::Validation(format!("not valid JSON: {}", e)))?;
    let Value::Object(mut config) = value else {
        return Err(PipelineError::Validation(
            "expected a JSON object".to_string(),
        ));
    };

    let data = match config.remove("data") {
        Some(data @ Value::Object(_)) => data,
        Some(_) => {
            return Err(PipelineError::Validation(
                "`data` must be an object".to_string(),
            ))
        }
        None => return Err(PipelineError::Validation("missing `data`".to_string())),
    };
    let chart_type = match config.remove("type") {
        Some(Value::String(t)) if !t.trim().is_empty() => t,
        _ => suggested.unwrap_or(ChartType::Bar).as_str().to_string(),
    };
    let options = config.remove("options").unwrap_or_else(|| json!({}));

    Ok(ChartSpec {
        chart_type,
        data,
        options,
    })
}

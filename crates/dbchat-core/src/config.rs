use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DbChatError, Result};

/// Top-level configuration for the dbchat service.
///
/// Loaded from `~/.dbchat/config.toml` by default. Each section corresponds
/// to one collaborator or cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DbChatConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
}

impl DbChatConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DbChatConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| DbChatError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// Hard errors are returned; soft problems are logged as warnings.
    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            return Err(DbChatError::Config(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.oracle.temperature) {
            return Err(DbChatError::Config(format!(
                "oracle.temperature must be within 0.0..=2.0, got {}",
                self.oracle.temperature
            )));
        }

        let report = self.pipeline.response_sections.validate();
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        if let Some(first) = report.errors.first() {
            return Err(DbChatError::Config(first.clone()));
        }
        Ok(())
    }
}

/// HTTP listener and logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Interface to bind.
    pub host: String,
    /// API server port.
    pub port: u16,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            log_level: "info".to_string(),
        }
    }
}

/// Chat-completions endpoint used as the reasoning oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    /// Model name sent with every request.
    pub model: String,
    /// Sampling temperature for open-ended replies and interpretation.
    pub temperature: f32,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.3,
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Data store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database kind reported to the oracle, e.g. "mongodb".
    pub kind: String,
    /// Directory of `<collection>.json` files for the in-memory store.
    pub data_dir: String,
    /// Documents sampled per collection when describing the database.
    pub sample_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: "mongodb".to_string(),
            data_dir: "~/.dbchat/data".to_string(),
            sample_size: 3,
        }
    }
}

/// Orchestration pipeline behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Offer and render charts.
    pub enable_charts: bool,
    /// Delay between word chunks when replaying a non-streamed reply.
    pub stream_pacing_ms: u64,
    /// Emit a "Thinking..." notice at the start of streamed responses.
    pub announce_thinking: bool,
    /// Rows of the result passed to the summarizer.
    pub summary_sample_rows: usize,
    /// Rows of the result passed to the chart advisor.
    pub chart_sample_rows: usize,
    /// Which staged sections of a query answer are emitted.
    #[serde(default)]
    pub response_sections: ResponseSections,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_charts: true,
            stream_pacing_ms: 20,
            announce_thinking: true,
            summary_sample_rows: 50,
            chart_sample_rows: 3,
            response_sections: ResponseSections::default(),
        }
    }
}

/// Section toggles for query answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResponseSections {
    pub intent: bool,
    pub reasoning: bool,
    pub query: bool,
    pub result: bool,
    pub summary: bool,
    pub chart_suggestion: bool,
    /// Keys that do not name a known section.
    #[serde(flatten, skip_serializing)]
    pub unknown: BTreeMap<String, toml::Value>,
}

impl Default for ResponseSections {
    fn default() -> Self {
        Self {
            intent: true,
            reasoning: true,
            query: true,
            result: true,
            summary: true,
            chart_suggestion: true,
            unknown: BTreeMap::new(),
        }
    }
}

/// Outcome of [`ResponseSections::validate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SectionReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl ResponseSections {
    /// Report unknown section names and a fully disabled answer.
    pub fn validate(&self) -> SectionReport {
        let mut report = SectionReport::default();
        for name in self.unknown.keys() {
            report
                .errors
                .push(format!("Invalid response section: {}", name));
        }
        if !(self.intent || self.reasoning || self.query || self.result || self.summary) {
            report.warnings.push(
                "All response sections are disabled. Users will see minimal output.".to_string(),
            );
        }
        report
    }
}

/// Session cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of sessions holding a pending chart suggestion.
    pub capacity: usize,
    /// Entry lifetime in seconds; 0 keeps entries until evicted.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl_secs: 3600,
        }
    }
}

/// System prompt source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// File caching the generated database description.
    pub path: String,
    /// Prompt used when no description can be loaded or generated.
    pub fallback: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            path: "~/.dbchat/system_prompt.txt".to_string(),
            fallback: "You are a helpful assistant.".to_string(),
        }
    }
}

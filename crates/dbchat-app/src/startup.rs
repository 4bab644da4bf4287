//! Startup helpers: path expansion and the system prompt.

use std::path::{Path, PathBuf};

use dbchat_chat::Oracle;
use dbchat_core::config::PromptConfig;
use dbchat_core::types::SystemPrompt;
use dbchat_store::DataStore;

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path.starts_with("~/") || path.starts_with("~\\") {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(&path[2..])
    } else {
        PathBuf::from(path)
    }
}

fn read_cached(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Generate a database description from collection samples.
async fn describe(
    store: &dyn DataStore,
    oracle: &dyn Oracle,
    sample_size: usize,
) -> Result<String, String> {
    let samples = store.sample(sample_size).await.map_err(|e| e.to_string())?;
    if samples.iter().all(|s| s.documents.is_empty()) {
        return Err("the store has no documents to describe".to_string());
    }
    let description = oracle
        .describe_database(store.kind(), &samples)
        .await
        .map_err(|e| e.to_string())?;
    let description = description.trim();
    if description.is_empty() {
        return Err("the oracle returned an empty description".to_string());
    }
    Ok(description.to_string())
}

/// Build the system prompt.
///
/// Reads the cached description at `config.path`; otherwise asks the oracle
/// to describe the store and caches the answer there. Falls back to
/// `config.fallback` when neither works.
pub async fn load_system_prompt(
    config: &PromptConfig,
    store: &dyn DataStore,
    oracle: &dyn Oracle,
    sample_size: usize,
) -> SystemPrompt {
    let path = expand_home(&config.path);

    if let Some(cached) = read_cached(&path) {
        tracing::info!(path = %path.display(), "Loaded cached system prompt");
        return SystemPrompt::new(&cached, store.kind());
    }

    match describe(store, oracle, sample_size).await {
        Ok(description) => {
            let written = path
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(&path, &description));
            match written {
                Ok(()) => tracing::info!(path = %path.display(), "Generated and cached system prompt"),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to cache system prompt")
                }
            }
            SystemPrompt::new(&description, store.kind())
        }
        Err(reason) => {
            tracing::warn!(reason = %reason, "Using fallback system prompt");
            SystemPrompt::new(&config.fallback, store.kind())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use dbchat_chat::OracleError;
    use dbchat_core::types::{ChartType, CollectionSample, Conversation, Interpretation};
    use dbchat_store::MemoryStore;
    use serde_json::{json, Value};

    struct DescribingOracle {
        describe_calls: AtomicUsize,
        fail: bool,
    }

    impl DescribingOracle {
        fn new(fail: bool) -> Self {
            Self {
                describe_calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl Oracle for DescribingOracle {
        async fn interpret(&self, _conversation: &Conversation) -> Result<Interpretation, OracleError> {
            Err(OracleError::Malformed("unused".into()))
        }

        async fn classify(&self, _conversation: &Conversation) -> Result<bool, OracleError> {
            Ok(false)
        }

        async fn confirm_chart(&self, _conversation: &Conversation) -> Result<bool, OracleError> {
            Ok(false)
        }

        async fn summarize(
            &self,
            _question: &str,
            _query_text: &str,
            _result_sample: &[Value],
            _system_prompt: &str,
        ) -> Result<String, OracleError> {
            Ok(String::new())
        }

        async fn advise_chart(
            &self,
            _query_text: &str,
            _result_sample: &[Value],
        ) -> Result<Option<ChartType>, OracleError> {
            Ok(None)
        }

        async fn generate_chart(
            &self,
            _query_text: &str,
            _result: &Value,
            _chart_type: Option<ChartType>,
        ) -> Result<String, OracleError> {
            Ok(String::new())
        }

        async fn reply(&self, _conversation: &Conversation) -> Result<String, OracleError> {
            Ok(String::new())
        }

        async fn describe_database(
            &self,
            db_kind: &str,
            samples: &[CollectionSample],
        ) -> Result<String, OracleError> {
            self.describe_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(OracleError::Timeout);
            }
            Ok(format!("A {} database with {} collections.", db_kind, samples.len()))
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new("mongodb").with_collection("sales", vec![json!({"_id": 1, "total": 5})])
    }

    fn prompt_config(path: &Path) -> PromptConfig {
        PromptConfig {
            path: path.to_string_lossy().to_string(),
            fallback: "You are a helpful assistant.".into(),
        }
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        assert_eq!(expand_home("~/.dbchat/x"), PathBuf::from(home).join(".dbchat/x"));
    }

    #[tokio::test]
    async fn test_generates_and_caches_description() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prompt.txt");
        let oracle = DescribingOracle::new(false);

        let prompt = load_system_prompt(&prompt_config(&path), &store(), &oracle, 3).await;
        assert_eq!(
            prompt.as_str(),
            "A mongodb database with 1 collections.\nThis is a mongodb database."
        );
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "A mongodb database with 1 collections."
        );

        // Second start reads the cache.
        load_system_prompt(&prompt_config(&path), &store(), &oracle, 3).await;
        assert_eq!(oracle.describe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        std::fs::write(&path, "Inventory data.\n").unwrap();
        let oracle = DescribingOracle::new(false);

        let prompt = load_system_prompt(&prompt_config(&path), &store(), &oracle, 3).await;
        assert_eq!(prompt.as_str(), "Inventory data.\nThis is a mongodb database.");
        assert_eq!(oracle.describe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_falls_back_on_oracle_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        let oracle = DescribingOracle::new(true);

        let prompt = load_system_prompt(&prompt_config(&path), &store(), &oracle, 3).await;
        assert_eq!(
            prompt.as_str(),
            "You are a helpful assistant.\nThis is a mongodb database."
        );
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_store_skips_oracle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.txt");
        let oracle = DescribingOracle::new(false);

        load_system_prompt(&prompt_config(&path), &MemoryStore::new("mongodb"), &oracle, 3).await;
        assert_eq!(oracle.describe_calls.load(Ordering::SeqCst), 0);
    }
}

//! OpenAI-compatible chat-completions oracle.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use dbchat_core::config::OracleConfig;
use dbchat_core::types::{ChartType, CollectionSample, Conversation, Interpretation, Role, Turn};

use super::{parse_confirm_chart, parse_interpretation, parse_yes_no, Oracle};
use crate::error::OracleError;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Oracle backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiOracle {
    /// Build a client, reading the API key from the configured environment
    /// variable.
    pub fn from_config(config: &OracleConfig) -> Result<Self, OracleError> {
        let api_key = std::env::var(&config.api_key_env).unwrap_or_default();
        if api_key.trim().is_empty() {
            return Err(OracleError::MissingApiKey(config.api_key_env.clone()));
        }
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &OracleConfig, api_key: String) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn complete(
        &self,
        messages: &[(&str, &str)],
        temperature: f32,
        response_format: Option<Value>,
    ) -> Result<String, OracleError> {
        let body = CompletionRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|&(role, content)| RequestMessage { role, content })
                .collect(),
            temperature,
            response_format,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!(status = %status, "Oracle request rejected");
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)
            .map_err(|e| OracleError::Malformed(format!("completion body: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| OracleError::Malformed("completion has no content".to_string()))?;
        tracing::debug!(chars = content.len(), "Oracle answered");
        Ok(content)
    }

    async fn ask(&self, system: &str, prompt: &str, temperature: f32) -> Result<String, OracleError> {
        self.complete(&[("system", system), ("user", prompt)], temperature, None)
            .await
    }
}

fn role_name(turn: &Turn) -> &'static str {
    match turn.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn pretty(value: &impl Serialize) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

/// JSON schema for interpretation answers.
fn interpretation_format() -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "query",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "intent": {"type": "string"},
                    "query": {"type": "string"},
                    "reasoning": {"type": "string"}
                },
                "required": ["intent", "query", "reasoning"],
                "additionalProperties": false
            }
        }
    })
}

#[async_trait]
impl Oracle for OpenAiOracle {
    async fn interpret(&self, conversation: &Conversation) -> Result<Interpretation, OracleError> {
        let messages: Vec<(&str, &str)> = conversation
            .turns()
            .iter()
            .map(|t| (role_name(t), t.content.as_str()))
            .collect();
        let text = self
            .complete(&messages, self.temperature, Some(interpretation_format()))
            .await?;
        parse_interpretation(&text)
    }

    async fn classify(&self, conversation: &Conversation) -> Result<bool, OracleError> {
        let prompt = format!(
            "You are a classifier. Decide whether the user is asking something that requires \
             querying the database described in the system prompt, or whether a general answer \
             is enough.\n\nRespond only with:\n- YES if a database query is required.\n\
             - NO if a general answer is enough.\n\nMessages:\n{}",
            pretty(conversation)
        );
        let answer = self.ask("You are a yes/no classifier.", &prompt, 0.0).await?;
        Ok(parse_yes_no(&answer))
    }

    async fn confirm_chart(&self, conversation: &Conversation) -> Result<bool, OracleError> {
        let prompt = format!(
            "Based on the following conversation, is the user confirming in their last message \
             that they want to see a chart? Consider only the last message. Respond only with \
             JSON:\n\n{{ \"confirmChart\": true }}\n\nor\n\n{{ \"confirmChart\": false }}\n\n\
             Conversation:\n{}",
            pretty(conversation)
        );
        let answer = self
            .ask(
                "You determine if the user has confirmed they'd like a chart. Respond only with valid JSON.",
                &prompt,
                0.0,
            )
            .await?;
        Ok(parse_confirm_chart(&answer))
    }

    async fn summarize(
        &self,
        question: &str,
        query_text: &str,
        result_sample: &[Value],
        system_prompt: &str,
    ) -> Result<String, OracleError> {
        let prompt = format!(
            "You are an assistant helping users understand data.\n\n\
             User question: {}\nQuery executed: {}\nRaw result: {}\n\n\
             If the result answers the question, summarise it for the user without describing \
             the query. If it does not, explain what the result shows and why it does not \
             answer the question.",
            question,
            query_text,
            pretty(&result_sample)
        );
        self.ask(system_prompt, &prompt, self.temperature).await
    }

    async fn advise_chart(
        &self,
        query_text: &str,
        result_sample: &[Value],
    ) -> Result<Option<ChartType>, OracleError> {
        let prompt = format!(
            "You are a chart advisor.\n\nThe query was: \"{}\"\nHere is a sample of the result \
             data:\n{}\n\nDoes this data lend itself to a visual representation? If so, \
             recommend one of \"bar\", \"line\", \"pie\", \"scatter\", otherwise \"none\".\n\n\
             Respond with a single word.",
            query_text,
            pretty(&result_sample)
        );
        let answer = self
            .ask("You are a data visualisation assistant.", &prompt, 0.0)
            .await?;
        Ok(ChartType::from_suggestion(&answer))
    }

    async fn generate_chart(
        &self,
        query_text: &str,
        result: &Value,
        chart_type: Option<ChartType>,
    ) -> Result<String, OracleError> {
        let kind = chart_type.map_or("bar", |t| t.as_str());
        let prompt = format!(
            "You are a Chart.js assistant.\n\nThe query was: \"{}\"\nYou previously recommended \
             a \"{}\" chart.\nHere is the data to chart:\n{}\n\nGenerate a valid JSON \
             configuration for a Chart.js chart of type \"{}\" using this data, with labels and \
             at least one dataset.\n\nRespond with only the JSON object.",
            query_text, kind, result, kind
        );
        self.ask(
            "You are a Chart.js generator that outputs only JSON configs.",
            &prompt,
            0.3,
        )
        .await
    }

    async fn reply(&self, conversation: &Conversation) -> Result<String, OracleError> {
        let messages: Vec<(&str, &str)> = conversation
            .turns()
            .iter()
            .map(|t| (role_name(t), t.content.as_str()))
            .collect();
        self.complete(&messages, self.temperature, None).await
    }

    async fn describe_database(
        &self,
        db_kind: &str,
        samples: &[CollectionSample],
    ) -> Result<String, OracleError> {
        let prompt = format!(
            "You are analysing the structure of a {} database.\n\n1. Summarise what this \
             database appears to represent.\n2. List each collection and the fields it \
             contains.\n3. Suggest what a user might ask about this data.\n\nSamples:\n{}",
            db_kind,
            pretty(&samples)
        );
        self.ask("You are a data analysis assistant.", &prompt, 0.2)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OracleConfig {
        OracleConfig {
            base_url: "http://localhost:9/v1/".to_string(),
            ..OracleConfig::default()
        }
    }

    #[test]
    fn test_endpoint_joins_base_url() {
        let oracle = OpenAiOracle::with_api_key(&config(), "sk-test".into()).unwrap();
        assert_eq!(oracle.endpoint, "http://localhost:9/v1/chat/completions");
        assert_eq!(oracle.model, "gpt-4o");
    }

    #[test]
    fn test_missing_api_key() {
        let config = OracleConfig {
            api_key_env: "DBCHAT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..OracleConfig::default()
        };
        let err = OpenAiOracle::from_config(&config).unwrap_err();
        assert!(matches!(err, OracleError::MissingApiKey(ref name) if name == "DBCHAT_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_request_serialization() {
        let body = CompletionRequest {
            model: "gpt-4o",
            messages: vec![RequestMessage {
                role: "user",
                content: "hi",
            }],
            temperature: 0.0,
            response_format: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}], "temperature": 0.0})
        );
    }

    #[test]
    fn test_response_parsing() {
        let parsed: CompletionResponse = serde_json::from_str(
            r#"{"id": "x", "choices": [{"index": 0, "message": {"role": "assistant", "content": "YES"}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some("YES"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_error() {
        let oracle = OpenAiOracle::with_api_key(&config(), "sk-test".into()).unwrap();
        let err = oracle.ask("system", "prompt", 0.0).await.unwrap_err();
        assert!(matches!(err, OracleError::Request(_) | OracleError::Timeout));
    }
}

//! Integration tests for the dbchat API.
//!
//! Each test builds its own router over an in-memory store and a scripted
//! oracle, then drives it with `oneshot` requests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use dbchat_api::handlers::HealthResponse;
use dbchat_api::{create_router, AppState};
use dbchat_chat::{ChatCompletion, Oracle, OracleError, PipelineSettings, QueryPipeline, SessionCache};
use dbchat_core::types::{ChartType, CollectionSample, Conversation, Interpretation, SystemPrompt};
use dbchat_store::MemoryStore;

// =============================================================================
// Helpers
// =============================================================================

/// Oracle that treats "yes" as a chart confirmation, "hello" as small talk
/// and everything else as a sales query.
struct ScriptedOracle {
    fail: bool,
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn interpret(&self, _conversation: &Conversation) -> Result<Interpretation, OracleError> {
        if self.fail {
            return Err(OracleError::Status {
                status: 503,
                body: "overloaded".into(),
            });
        }
        Ok(Interpretation {
            intent: "Total sales per region".into(),
            query_text: "db.sales.aggregate([{$group: {_id: '$region', total: {$sum: '$total'}}}]).sort({_id: 1})"
                .into(),
            reasoning: "Group sales by region.".into(),
        })
    }

    async fn classify(&self, conversation: &Conversation) -> Result<bool, OracleError> {
        Ok(!conversation.latest_user_turn().starts_with("hello"))
    }

    async fn confirm_chart(&self, conversation: &Conversation) -> Result<bool, OracleError> {
        Ok(conversation.latest_user_turn().eq_ignore_ascii_case("yes"))
    }

    async fn summarize(
        &self,
        _question: &str,
        _query_text: &str,
        result_sample: &[Value],
        _system_prompt: &str,
    ) -> Result<String, OracleError> {
        Ok(format!("{} regions have sales.", result_sample.len()))
    }

    async fn advise_chart(
        &self,
        _query_text: &str,
        _result_sample: &[Value],
    ) -> Result<Option<ChartType>, OracleError> {
        Ok(Some(ChartType::Bar))
    }

    async fn generate_chart(
        &self,
        _query_text: &str,
        result: &Value,
        chart_type: Option<ChartType>,
    ) -> Result<String, OracleError> {
        let rows = result.as_array().cloned().unwrap_or_default();
        let labels: Vec<Value> = rows.iter().map(|r| r["_id"].clone()).collect();
        let data: Vec<Value> = rows.iter().map(|r| r["total"].clone()).collect();
        Ok(json!({
            "type": chart_type.map_or("bar", |t| t.as_str()),
            "data": {"labels": labels, "datasets": [{"label": "Total", "data": data}]},
        })
        .to_string())
    }

    async fn reply(&self, _conversation: &Conversation) -> Result<String, OracleError> {
        Ok("Hi! Ask me about sales.".into())
    }

    async fn describe_database(
        &self,
        _db_kind: &str,
        _samples: &[CollectionSample],
    ) -> Result<String, OracleError> {
        Ok("Sales records.".into())
    }
}

fn make_app_with(fail: bool) -> axum::Router {
    let store = MemoryStore::new("mongodb").with_collection(
        "sales",
        vec![
            json!({"_id": 1, "region": "EU", "total": 120}),
            json!({"_id": 2, "region": "US", "total": 300}),
            json!({"_id": 3, "region": "EU", "total": 80}),
        ],
    );
    let settings = PipelineSettings {
        pacing: Duration::ZERO,
        ..PipelineSettings::default()
    };
    let pipeline = QueryPipeline::new(
        Arc::new(ScriptedOracle { fail }),
        Arc::new(store),
        Arc::new(SessionCache::new(16, None)),
        settings,
        SystemPrompt::new("Sales records.", "mongodb"),
    );
    create_router(AppState::new(pipeline, "gpt-4o"))
}

fn make_app() -> axum::Router {
    make_app_with(false)
}

fn chat_request(body: Value, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::post("/v1/chat/completions").header("content-type", "application/json");
    if let Some(session) = session {
        builder = builder.header("x-session-id", session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn user(text: &str) -> Value {
    json!({"messages": [{"role": "user", "content": text}]})
}

fn streamed(text: &str) -> Value {
    json!({"messages": [{"role": "user", "content": text}], "stream": true})
}

/// Read full response body bytes.
async fn body_bytes(resp: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap()
        .to_vec()
}

async fn completion(app: axum::Router, body: Value, session: Option<&str>) -> ChatCompletion {
    let resp = app.oneshot(chat_request(body, session)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    serde_json::from_slice(&body_bytes(resp).await).unwrap()
}

/// Split an SSE body into `data:` payloads.
fn sse_payloads(body: &[u8]) -> Vec<String> {
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.ends_with("\n\n"));
    text.split("\n\n")
        .filter(|event| !event.is_empty())
        .map(|event| {
            event
                .strip_prefix("data: ")
                .unwrap_or_else(|| panic!("unexpected event: {event:?}"))
                .to_string()
        })
        .collect()
}

// =============================================================================
// Liveness
// =============================================================================

#[tokio::test]
async fn test_index_text() {
    let resp = make_app()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"dbchat is running");
}

#[tokio::test]
async fn test_health_happy_path() {
    let resp = make_app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.cached_sessions, 0);
}

// =============================================================================
// Request validation
// =============================================================================

#[tokio::test]
async fn test_missing_messages_is_400() {
    let resp = make_app()
        .oneshot(chat_request(json!({"model": "gpt-4o"}), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["error"]["message"], "Missing 'messages' array");
}

#[tokio::test]
async fn test_no_user_turn_is_400() {
    let resp = make_app()
        .oneshot(chat_request(
            json!({"messages": [{"role": "system", "content": "be terse"}]}),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(body["error"]["message"], "No user message found.");
}

// =============================================================================
// Aggregated responses
// =============================================================================

#[tokio::test]
async fn test_query_answer_aggregated() {
    let completion = completion(make_app(), user("sales by region?"), None).await;

    assert!(completion.id.starts_with("chatcmpl-"));
    assert_eq!(completion.object, "chat.completion");
    assert_eq!(completion.model, "gpt-4o");
    let message = &completion.choices[0].message;
    let content = message.content.as_deref().unwrap();
    assert!(content.starts_with("**Intent:** Total sales per region\n"));
    assert!(content.contains("\"total\": 200"));
    assert!(content.contains("**Summary:**\n2 regions have sales.\n"));
    assert!(content.ends_with("Would you like me to show this result as a bar chart?\n"));
    assert!(message.tool_calls.is_empty());
    assert_eq!(completion.choices[0].finish_reason, "stop");
}

#[tokio::test]
async fn test_plain_reply_aggregated_without_thinking_notice() {
    let completion = completion(make_app(), user("hello there"), None).await;
    assert_eq!(
        completion.choices[0].message.content.as_deref(),
        Some("Hi! Ask me about sales.")
    );
}

#[tokio::test]
async fn test_chart_confirmation_is_per_session() {
    let app = make_app();
    completion(app.clone(), user("sales by region?"), Some("thread-1")).await;

    let other = completion(app.clone(), user("yes"), Some("thread-2")).await;
    assert!(other.choices[0].message.tool_calls.is_empty());

    let chart = completion(app, user("yes"), Some("thread-1")).await;
    let message = &chart.choices[0].message;
    assert!(message.content.is_none());
    assert_eq!(message.tool_calls.len(), 1);
    let call = &message.tool_calls[0];
    assert_eq!(call.id, "tool_call_chart_1");
    assert_eq!(call.function.name, "chart_renderer");
    let args: Value = serde_json::from_str(&call.function.arguments).unwrap();
    assert_eq!(args["type"], "bar");
    assert_eq!(args["data"]["labels"], json!(["EU", "US"]));
}

#[tokio::test]
async fn test_session_falls_back_to_user_field() {
    let app = make_app();
    let mut first = user("sales by region?");
    first["user"] = json!("alice");
    completion(app.clone(), first, None).await;

    let mut confirm = user("yes");
    confirm["user"] = json!("alice");
    let chart = completion(app, confirm, None).await;
    assert_eq!(chart.choices[0].message.tool_calls.len(), 1);
}

#[tokio::test]
async fn test_oracle_failure_is_500() {
    let resp = make_app_with(true)
        .oneshot(chat_request(user("sales by region?"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(
        body["error"]["message"],
        "oracle returned HTTP 503: overloaded"
    );
}

// =============================================================================
// Streamed responses
// =============================================================================

#[tokio::test]
async fn test_stream_framing() {
    let resp = make_app()
        .oneshot(chat_request(streamed("sales by region?"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let payloads = sse_payloads(&body_bytes(resp).await);
    let n = payloads.len();
    assert_eq!(payloads[n - 1], "[DONE]");
    assert_eq!(
        payloads[n - 2],
        r#"{"choices":[{"delta":{},"index":0,"finish_reason":"stop"}]}"#
    );
    assert_eq!(payloads.iter().filter(|p| *p == "[DONE]").count(), 1);

    let content: String = payloads[..n - 2]
        .iter()
        .map(|p| {
            let frame: Value = serde_json::from_str(p).unwrap();
            assert!(frame["choices"][0].get("finish_reason").is_none());
            frame["choices"][0]["delta"]["content"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert!(content.starts_with("🤔 Thinking...\n\n**Intent:**"));
    assert!(content.contains("**Summary:**"));
}

#[tokio::test]
async fn test_stream_plain_reply_is_word_chunks() {
    let resp = make_app()
        .oneshot(chat_request(streamed("hello"), None))
        .await
        .unwrap();
    let payloads = sse_payloads(&body_bytes(resp).await);
    let words: Vec<String> = payloads
        .iter()
        .filter_map(|p| serde_json::from_str::<Value>(p).ok())
        .filter_map(|f| f["choices"][0]["delta"]["content"].as_str().map(String::from))
        .skip(1)
        .collect();
    assert_eq!(words, vec!["Hi! ", "Ask ", "me ", "about ", "sales. "]);
}

#[tokio::test]
async fn test_stream_oracle_failure_renders_error_then_done() {
    let resp = make_app_with(true)
        .oneshot(chat_request(streamed("sales by region?"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let payloads = sse_payloads(&body_bytes(resp).await);
    assert_eq!(payloads.len(), 4);
    let error: Value = serde_json::from_str(&payloads[1]).unwrap();
    assert_eq!(
        error["choices"][0]["delta"]["content"],
        "❌ Error: oracle returned HTTP 503: overloaded\n"
    );
    assert_eq!(payloads[3], "[DONE]");
}

#[tokio::test]
async fn test_stream_chart_tool_call_frame() {
    let app = make_app();
    completion(app.clone(), user("sales by region?"), Some("s")).await;

    let resp = app
        .oneshot(chat_request(streamed("yes"), Some("s")))
        .await
        .unwrap();
    let payloads = sse_payloads(&body_bytes(resp).await);
    // thinking notice, tool call, stop, [DONE]
    assert_eq!(payloads.len(), 4);
    let frame: Value = serde_json::from_str(&payloads[1]).unwrap();
    let call = &frame["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(call["index"], 0);
    assert_eq!(call["type"], "function");
    assert_eq!(call["function"]["name"], "chart_renderer");
}

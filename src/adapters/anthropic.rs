//! Anthropic Messages API adapter.
//!
//! Translates the router's normalized [`ChatMessage`] list into Anthropic's
//! [`/v1/messages`](https://docs.anthropic.com/en/api/messages) schema and
//! back. System messages have no dedicated role in Anthropic's wire format —
//! they're concatenated into the top-level `system` field, mirroring how the
//! teacher's OpenAI-to-Anthropic translation handled it.
//!
//! | Concern | Router | Anthropic |
//! |---|---|---|
//! | System prompt | `MessageRole::System` messages | top-level `system` field |
//! | Max tokens | optional | **required** (`max_tokens`) |
//! | Finish reasons | n/a (unused) | `end_turn`, `max_tokens` |
//! | Auth header | n/a | `x-api-key` |

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{estimate_tokens, validate_messages, Adapter, ChatStream};
use crate::error::{ErrorKind, Result, RouterError};
use crate::types::{CallOptions, ChatChunk, ChatMessage, ChatResponse, MessageRole, TokenUsage};

const DEFAULT_MAX_TOKENS: u64 = 8_192;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    name: String,
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(name: impl Into<String>, base_url: String, timeout_ms: u64, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&api_key)
                .expect("Anthropic API key contains invalid header characters"),
        );
        headers.insert("anthropic-version", header::HeaderValue::from_static(ANTHROPIC_VERSION));

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self { name: name.into(), client, stream_client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    fn request_body(&self, model: &str, messages: &[ChatMessage], options: &CallOptions, stream: bool) -> Value {
        let mut system_parts = Vec::new();
        let mut turns = Vec::new();
        for message in messages {
            match message.role {
                MessageRole::System => system_parts.push(message.content.as_str()),
                MessageRole::User => turns.push(json!({ "role": "user", "content": message.content })),
                MessageRole::Assistant => turns.push(json!({ "role": "assistant", "content": message.content })),
            }
        }

        let mut body = json!({
            "model": model,
            "max_tokens": options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS as u32),
            "messages": turns,
            "stream": stream,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatResponse> {
        validate_messages(messages)?;
        let started = Instant::now();
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.request_body(model, messages, options, false))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RouterError::new(ErrorKind::TimeoutTransport, e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &text).with_provider(&self.name).with_model(model));
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| RouterError::new(ErrorKind::ServerError, format!("invalid JSON body: {e}")))?;

        let content = body["content"]
            .as_array()
            .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
            .and_then(|b| b["text"].as_str())
            .unwrap_or_default()
            .to_string();

        let mut metadata = serde_json::Map::new();
        let tokens = match body.get("usage") {
            Some(usage) => TokenUsage::new(
                usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                usage["output_tokens"].as_u64().unwrap_or(0) as u32,
            ),
            None => {
                metadata.insert("estimated".to_string(), json!(true));
                TokenUsage::new(0, estimate_tokens(&content))
            }
        };

        Ok(ChatResponse {
            content,
            tokens,
            cost: 0.0,
            provider: self.name.clone(),
            model: model.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
            metadata,
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatStream> {
        validate_messages(messages)?;
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&self.request_body(model, messages, options, true))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text).with_provider(&self.name).with_model(model));
        }

        let provider = self.name.clone();
        let model = model.to_string();
        let mut index = 0u32;
        let stream = response.bytes_stream().map(move |chunk| {
            let chunk = chunk.map_err(|e| transport_error(&e))?;
            let text = String::from_utf8_lossy(&chunk).into_owned();
            let done = text.contains("\"type\":\"message_stop\"");
            let content = extract_delta_text(&text);
            let out = ChatChunk {
                provider: provider.clone(),
                model: model.clone(),
                role: "assistant".to_string(),
                chunk_index: index,
                content,
                done,
                metadata: serde_json::Map::new(),
            };
            index += 1;
            Ok(out)
        });
        Ok(Box::pin(stream))
    }
}

fn transport_error(e: &reqwest::Error) -> RouterError {
    if e.is_timeout() {
        RouterError::new(ErrorKind::TimeoutTransport, e.to_string())
    } else {
        RouterError::new(ErrorKind::ServerError, e.to_string())
    }
}

fn classify_status(status: reqwest::StatusCode, text: &str) -> RouterError {
    let kind = match status.as_u16() {
        401 | 403 => ErrorKind::Auth,
        429 => ErrorKind::RateLimited,
        400 | 422 => ErrorKind::Validation,
        s if s >= 500 => ErrorKind::ServerError,
        _ => ErrorKind::ServerError,
    };
    RouterError::new(kind, format!("HTTP {status}: {text}"))
}

/// Extract `delta.text` from Anthropic's `content_block_delta` SSE events.
fn extract_delta_text(raw: &str) -> String {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter_map(|payload| serde_json::from_str::<Value>(payload).ok())
        .filter(|v| v["type"] == "content_block_delta")
        .filter_map(|v| v.pointer("/delta/text").and_then(Value::as_str).map(String::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> AnthropicAdapter {
        AnthropicAdapter::new("anthropic", server.uri(), 5_000, "test-key".into())
    }

    #[test]
    fn request_body_moves_system_messages_to_top_level_field() {
        let adapter = AnthropicAdapter::new("anthropic", "http://x".into(), 1000, "k".into());
        let messages =
            vec![ChatMessage::system("be nice"), ChatMessage::user("hello")];
        let body = adapter.request_body("claude-test", &messages, &CallOptions::default(), false);

        assert_eq!(body["system"], "be nice");
        let turns = body["messages"].as_array().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0]["role"], "user");
    }

    #[test]
    fn request_body_defaults_max_tokens_when_absent() {
        let adapter = AnthropicAdapter::new("anthropic", "http://x".into(), 1000, "k".into());
        let messages = vec![ChatMessage::user("hi")];
        let body = adapter.request_body("claude-test", &messages, &CallOptions::default(), false);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[tokio::test]
    async fn chat_extracts_text_block_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{ "type": "text", "text": "Hello!" }],
                "stop_reason": "end_turn",
                "usage": { "input_tokens": 10, "output_tokens": 5 },
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let messages = vec![ChatMessage::user("hi")];
        let response = adapter.chat("claude-test", &messages, &CallOptions::default()).await.unwrap();

        assert_eq!(response.content, "Hello!");
        assert_eq!(response.tokens, TokenUsage::new(10, 5));
        assert!(!response.metadata.contains_key("estimated"));
    }

    #[tokio::test]
    async fn chat_estimates_tokens_when_usage_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "content": [{ "type": "text", "text": "ok" }],
                "stop_reason": "end_turn",
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let messages = vec![ChatMessage::user("hi")];
        let response = adapter.chat("claude-test", &messages, &CallOptions::default()).await.unwrap();

        assert_eq!(response.tokens.input, 0);
        assert_eq!(response.tokens.output, estimate_tokens("ok"));
        assert_eq!(response.metadata.get("estimated"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn chat_maps_403_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let messages = vec![ChatMessage::user("hi")];
        let err = adapter.chat("claude-test", &messages, &CallOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
    }
}

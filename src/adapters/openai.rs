//! OpenAI-compatible chat completions adapter.
//!
//! Handles any provider that speaks the OpenAI `/v1/chat/completions`
//! protocol — OpenAI itself, and any OpenAI-compatible gateway a deployer
//! points this at. Request/response shapes are native; no schema
//! translation is needed (contrast [`super::anthropic`]).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{estimate_tokens, validate_messages, Adapter, ChatStream};
use crate::error::{ErrorKind, Result, RouterError};
use crate::types::{CallOptions, ChatChunk, ChatMessage, ChatResponse, TokenUsage};

pub struct OpenAIAdapter {
    name: String,
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
}

impl OpenAIAdapter {
    pub fn new(name: impl Into<String>, base_url: String, timeout_ms: u64, api_key: Option<String>) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key {
            let value = format!("Bearer {key}");
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .expect("API key contains invalid Authorization header characters"),
            );
        }

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

    fn body(&self, model: &str, messages: &[ChatMessage], options: &CallOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        body
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
}

#[async_trait]
impl Adapter for OpenAIAdapter {
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
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.body(model, messages, options, false))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RouterError::new(ErrorKind::TimeoutTransport, e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify_status(status, &text).with_provider(&self.name).with_model(model));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| RouterError::new(ErrorKind::ServerError, format!("invalid JSON body: {e}")))?;

        let content = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let (tokens, estimated) = match parsed.get("usage") {
            Some(usage) => (
                TokenUsage::new(
                    usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                    usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                ),
                false,
            ),
            None => (TokenUsage::new(0, estimate_tokens(&content)), true),
        };

        let mut metadata = serde_json::Map::new();
        if estimated {
            metadata.insert("estimated".to_string(), json!(true));
        }

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
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&self.body(model, messages, options, true))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &text).with_provider(&self.name).with_model(model));
        }

        let provider = self.name.clone();
        let model = model.to_string();
        let mut index = 0u32;
        let stream = response.bytes_stream().map(move |chunk| {
            let chunk = chunk.map_err(|e| transport_error(&e))?;
            let text = String::from_utf8_lossy(&chunk).into_owned();
            let done = text.contains("[DONE]");
            let content = extract_sse_delta(&text);
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

/// Pull the incremental `delta.content` string out of one `data: {...}` SSE
/// line. Unrecognized lines (comments, `[DONE]`) yield an empty delta.
fn extract_sse_delta(raw: &str) -> String {
    raw.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|payload| *payload != "[DONE]")
        .filter_map(|payload| serde_json::from_str::<Value>(payload).ok())
        .filter_map(|v| v.pointer("/choices/0/delta/content").and_then(Value::as_str).map(String::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> OpenAIAdapter {
        OpenAIAdapter::new("openai", server.uri(), 5_000, None)
    }

    #[tokio::test]
    async fn chat_returns_parsed_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "hello there" } }],
                "usage": { "prompt_tokens": 5, "completion_tokens": 2 },
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let messages = vec![ChatMessage::user("hi")];
        let response = adapter.chat("gpt-test", &messages, &CallOptions::default()).await.unwrap();

        assert_eq!(response.content, "hello there");
        assert_eq!(response.tokens, TokenUsage::new(5, 2));
        assert!(!response.metadata.contains_key("estimated"));
    }

    #[tokio::test]
    async fn chat_estimates_tokens_when_usage_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "ok" } }],
            })))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let messages = vec![ChatMessage::user("hi")];
        let response = adapter.chat("gpt-test", &messages, &CallOptions::default()).await.unwrap();

        assert_eq!(response.tokens.input, 0);
        assert_eq!(response.tokens.output, estimate_tokens("ok"));
        assert_eq!(response.metadata.get("estimated"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn chat_maps_429_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let messages = vec![ChatMessage::user("hi")];
        let err = adapter.chat("gpt-test", &messages, &CallOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[tokio::test]
    async fn chat_maps_401_to_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .mount(&server)
            .await;

        let adapter = adapter_for(&server);
        let messages = vec![ChatMessage::user("hi")];
        let err = adapter.chat("gpt-test", &messages, &CallOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
    }

    #[test]
    fn extract_sse_delta_pulls_content_from_data_line() {
        let raw = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
        assert_eq!(extract_sse_delta(raw), "hi");
    }

    #[test]
    fn body_serializes_role_as_snake_case() {
        let adapter = OpenAIAdapter::new("openai", "http://x".into(), 1000, None);
        let messages = vec![ChatMessage { role: MessageRole::User, content: "hi".into() }];
        let body = adapter.body("m", &messages, &CallOptions::default(), false);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}

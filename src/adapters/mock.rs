//! Deterministic stub provider adapter.
//!
//! Used by tests that exercise fallback, queueing, caching, and streaming
//! without a network dependency (spec §8 testable property 8 calls for "a
//! deterministic stub provider for tests"). Behavior is entirely driven by
//! the builder methods — no randomness, no wall-clock dependence beyond an
//! optional configured latency.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt as _};

use super::{estimate_tokens, validate_messages, Adapter, ChatStream};
use crate::error::{ErrorKind, Result, RouterError};
use crate::types::{CallOptions, ChatChunk, ChatMessage, ChatResponse, MessageRole, TokenUsage};

pub struct MockAdapter {
    name: String,
    fail_with: Option<ErrorKind>,
    latency: Duration,
    calls: AtomicU32,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fail_with: None, latency: Duration::ZERO, calls: AtomicU32::new(0) }
    }

    /// Always fail with the given kind, for fallback-chain tests (scenario S2).
    pub fn failing(mut self, kind: ErrorKind) -> Self {
        self.fail_with = Some(kind);
        self
    }

    /// Sleep this long before responding, for queueing/priority tests
    /// (scenario S3).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of `chat`/`chat_stream` calls observed so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn echo(messages: &[ChatMessage]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        format!("echo: {last_user}")
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &CallOptions,
    ) -> Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        validate_messages(messages)?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(kind) = self.fail_with {
            return Err(RouterError::new(kind, "mock adapter configured to fail")
                .with_provider(&self.name)
                .with_model(model));
        }

        let content = Self::echo(messages);
        let output = estimate_tokens(&content);

        let mut metadata = serde_json::Map::new();
        metadata.insert("estimated".to_string(), serde_json::json!(true));

        Ok(ChatResponse {
            content,
            tokens: TokenUsage::new(0, output),
            cost: 0.0,
            provider: self.name.clone(),
            model: model.to_string(),
            latency_ms: self.latency.as_millis() as u64,
            cached: false,
            metadata,
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _options: &CallOptions,
    ) -> Result<ChatStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        validate_messages(messages)?;
        if let Some(kind) = self.fail_with {
            return Err(RouterError::new(kind, "mock adapter configured to fail")
                .with_provider(&self.name)
                .with_model(model));
        }

        let content = Self::echo(messages);
        let words: Vec<String> = content.split(' ').map(String::from).collect();
        let total = words.len();
        let provider = self.name.to_string();
        let model = model.to_string();
        let latency = self.latency;

        let chunks = words.into_iter().enumerate().map(move |(i, word)| ChatChunk {
            provider: provider.clone(),
            model: model.clone(),
            role: "assistant".to_string(),
            chunk_index: i as u32,
            content: word,
            done: i + 1 == total,
            metadata: serde_json::Map::new(),
        });

        let owned_stream = stream::iter(chunks.map(Ok)).then(move |chunk: Result<ChatChunk>| {
            let latency = latency;
            async move {
                if !latency.is_zero() {
                    tokio::time::sleep(latency / 4).await;
                }
                chunk
            }
        });

        Ok(Box::pin(owned_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt as _;

    #[tokio::test]
    async fn chat_echoes_last_user_message() {
        let adapter = MockAdapter::new("mock");
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("ping")];
        let response = adapter.chat("m1", &messages, &CallOptions::default()).await.unwrap();
        assert_eq!(response.content, "echo: ping");
    }

    #[tokio::test]
    async fn chat_fails_with_configured_error_kind() {
        let adapter = MockAdapter::new("mock").failing(ErrorKind::ServerError);
        let messages = vec![ChatMessage::user("ping")];
        let err = adapter.chat("m1", &messages, &CallOptions::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);
    }

    #[tokio::test]
    async fn chat_stream_marks_only_the_last_chunk_done() {
        let adapter = MockAdapter::new("mock");
        let messages = vec![ChatMessage::user("a b c")];
        let mut stream = adapter.chat_stream("m1", &messages, &CallOptions::default()).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        assert!(chunks.iter().rev().skip(1).all(|c| !c.done));
        assert!(chunks.last().unwrap().done);
    }

    #[tokio::test]
    async fn calls_counter_increments_per_invocation() {
        let adapter = MockAdapter::new("mock");
        let messages = vec![ChatMessage::user("hi")];
        adapter.chat("m1", &messages, &CallOptions::default()).await.unwrap();
        adapter.chat("m1", &messages, &CallOptions::default()).await.unwrap();
        assert_eq!(adapter.calls(), 2);
    }
}

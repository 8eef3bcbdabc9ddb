//! Ollama adapter.
//!
//! Ollama ships an OpenAI-compatible `/v1/chat/completions` endpoint, so
//! this adapter delegates request/response shaping to the same logic as
//! [`super::openai::OpenAIAdapter`] and only differs in construction (no
//! API key by default).

use async_trait::async_trait;

use super::{Adapter, ChatStream, OpenAIAdapter};
use crate::error::Result;
use crate::types::{CallOptions, ChatMessage, ChatResponse};

pub struct OllamaAdapter {
    inner: OpenAIAdapter,
}

impl OllamaAdapter {
    pub fn new(name: impl Into<String>, base_url: String, timeout_ms: u64) -> Self {
        Self { inner: OpenAIAdapter::new(name, base_url, timeout_ms, None) }
    }
}

#[async_trait]
impl Adapter for OllamaAdapter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatResponse> {
        self.inner.chat(model, messages, options).await
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatStream> {
        self.inner.chat_stream(model, messages, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_delegates_to_inner_openai_adapter() {
        let adapter = OllamaAdapter::new("ollama-local", "http://localhost:11434".into(), 5_000);
        assert_eq!(adapter.name(), "ollama-local");
    }
}

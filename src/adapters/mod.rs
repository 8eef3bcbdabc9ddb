//! Provider adapter trait and concrete adapters (spec §4.1).
//!
//! [`Adapter`] is the uniform capability surface the router dispatches
//! through: `chat`, `chat_stream`, `calculate_cost`, `is_retryable_error`,
//! `name`. Each provider — OpenAI, Anthropic, Ollama, and the deterministic
//! `mock` used in tests — implements it once; [`crate::registry::Registry`]
//! stores them behind `Arc<dyn Adapter>` (teacher: `BackendClient` enum
//! dispatch, generalized here to trait objects so providers can be
//! registered at runtime per spec §4.2, rather than matched on a closed
//! enum known at compile time).

mod anthropic;
mod mock;
mod ollama;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use mock::MockAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use crate::config::ModelPricing;
use crate::error::{ErrorKind, Result, RouterError};
use crate::types::{CallOptions, ChatChunk, ChatMessage, ChatResponse, TokenUsage};

/// A `Send`-able stream of normalized response chunks.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>;

/// Uniform capability surface every provider adapter implements (spec §4.1).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable provider name, used as the registry key and in traffic/cost
    /// records. Must match the `provider` field of the [`crate::types::Candidate`]s
    /// that reference this adapter.
    fn name(&self) -> &str;

    /// Issue one buffered chat call.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatResponse>;

    /// Issue a streaming chat call. Mid-stream failures surface as an `Err`
    /// item in the stream; they do not trigger fallback (spec §4.11 "no
    /// mid-stream fallback").
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CallOptions,
    ) -> Result<ChatStream>;

    /// Compute the dollar cost of a call from its token usage and the
    /// configured per-million pricing. Returns `0.0` when no pricing entry
    /// exists for this model — the router still tags the response metadata
    /// with `"estimated": true` in that case so cost reports aren't silently
    /// misleading (spec §4.7).
    fn calculate_cost(&self, usage: TokenUsage, pricing: Option<ModelPricing>) -> f64 {
        let Some(pricing) = pricing else { return 0.0 };
        let input_cost = (usage.input as f64 / 1_000_000.0) * pricing.input;
        let output_cost = (usage.output as f64 / 1_000_000.0) * pricing.output;
        input_cost + output_cost
    }

    /// Whether this error, as raised by this adapter, should be retried
    /// within the same candidate before advancing to a fallback (spec §7).
    /// The default defers to the error kind's own classification; adapters
    /// override only when a provider needs a narrower rule.
    fn is_retryable_error(&self, error: &RouterError) -> bool {
        error.kind.is_retryable()
    }
}

/// Rough token estimate (`ceil(len / 4)`) used when a provider doesn't
/// report usage. Matches the order-of-magnitude heuristic common across the
/// pack; not a real tokenizer, so callers should treat it as an estimate
/// (spec §4.1 "estimated=true metadata flag when exact counts are
/// unavailable").
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    ((text.len() + 3) / 4) as u32
}

pub(crate) fn validate_messages(messages: &[ChatMessage]) -> Result<()> {
    if messages.is_empty() {
        return Err(RouterError::new(ErrorKind::Validation, "messages must not be empty"));
    }
    if messages.iter().any(|m| m.content.trim().is_empty()) {
        return Err(RouterError::new(ErrorKind::Validation, "message content must not be blank"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn validate_messages_rejects_empty_list() {
        assert!(validate_messages(&[]).is_err());
    }

    #[test]
    fn validate_messages_rejects_blank_content() {
        let messages = vec![ChatMessage::user("   ")];
        assert!(validate_messages(&messages).is_err());
    }

    #[test]
    fn validate_messages_accepts_well_formed_list() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        assert!(validate_messages(&messages).is_ok());
    }
}

//! Normalized request/response data model (spec §3).
//!
//! These types are the router's public vocabulary: callers build a
//! [`ChatRequest`] from a role and a message list, and get back a
//! [`ChatResponse`] (or a stream of [`ChatChunk`]s) regardless of which
//! provider actually served the call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One message in a chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: MessageRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Queue priority class (spec §4.4). Ordered `High > Normal > Low`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Recognized per-call options (spec §3). Every field here is either
/// consumed by the router core directly or forwarded opaquely to adapters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub project_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    #[serde(default)]
    pub priority: Priority,
    pub task_type: Option<String>,
    pub correlation_id: Option<String>,
    pub template_name: Option<String>,
    #[serde(default)]
    pub template_variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub stream: bool,
}

fn default_use_cache() -> bool {
    true
}

impl CallOptions {
    /// The options that participate in the cache key (spec §4.5/Glossary
    /// "salient options"). Excludes correlation/user ids, template fields
    /// (rendering happens before the cache key is computed, so the
    /// rendered message content already captures them), and `stream`
    /// (streaming responses are never cached per spec §4.11).
    pub fn salient(&self) -> SalientOptions {
        SalientOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            task_type: self.task_type.clone(),
        }
    }
}

/// The options subset that is cache-key salient. Kept as a distinct type so
/// `cache_key` can't accidentally hash a non-salient field.
#[derive(Debug, Clone, Serialize)]
pub struct SalientOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub task_type: Option<String>,
}

/// A `(provider, model)` pair — a candidate in a role's dispatch chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub provider: String,
    pub model: String,
}

impl Candidate {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self { provider: provider.into(), model: model.into() }
    }
}

/// Token usage for one call. `total >= input + output` is allowed — some
/// providers report reasoning tokens folded into `total` (spec §3/§8 Open
/// Questions).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn new(input: u32, output: u32) -> Self {
        Self { input, output, total: input + output }
    }
}

/// A normalized chat response, identical in shape whether it came from a
/// live provider call or the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub provider: String,
    pub model: String,
    pub latency_ms: u64,
    pub cached: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One chunk of a streamed response (spec §4.1/§4.11).
#[derive(Debug, Clone, Serialize)]
pub struct ChatChunk {
    pub provider: String,
    pub model: String,
    pub role: String,
    pub chunk_index: u32,
    pub content: String,
    pub done: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_is_high_over_normal_over_low() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn salient_options_excludes_correlation_and_user_ids() {
        let opts = CallOptions {
            correlation_id: Some("abc".into()),
            user_id: Some("u1".into()),
            max_tokens: Some(100),
            ..Default::default()
        };
        let salient = opts.salient();
        assert_eq!(salient.max_tokens, Some(100));
        // SalientOptions has no correlation_id/user_id fields at all — the
        // type system enforces exclusion rather than a runtime filter.
    }

    #[test]
    fn token_usage_total_is_sum_by_default() {
        let t = TokenUsage::new(10, 5);
        assert_eq!(t.total, 15);
    }
}

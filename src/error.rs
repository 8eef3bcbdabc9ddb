//! Router error type.
//!
//! [`RouterError`] carries a stable, language-neutral [`ErrorKind`] alongside
//! enough context (provider, model, correlation id, prior attempts) for a
//! caller to decide whether to retry, report, or give up. Unlike the teacher's
//! `AppError` — which exists only to turn `anyhow::Error` into an HTTP
//! response — this type is the router's primary `Result` error and is
//! constructed directly by every component, not just at the HTTP edge. It
//! still implements `IntoResponse` so the admin binary can propagate it with
//! `?` exactly as the teacher's handlers do.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::json;

/// Stable, language-neutral error classification (spec §7).
///
/// The propagation rule (retried in adapter? falls back to next provider?)
/// is fixed per kind and enforced by [`crate::router`], not by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Config,
    TemplateMissingVars,
    TemplateSyntax,
    QueueFull,
    TimeoutQueue,
    TimeoutTransport,
    RateLimited,
    Auth,
    ServerError,
    ContentPolicy,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether an adapter should retry this error within the *same* candidate,
    /// per the table in spec §7.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TimeoutTransport | ErrorKind::RateLimited | ErrorKind::ServerError
        )
    }

    /// Whether exhausting this error on one candidate should advance to the
    /// next fallback candidate, per the table in spec §7.
    pub fn allows_fallback(self) -> bool {
        matches!(
            self,
            ErrorKind::TimeoutTransport
                | ErrorKind::RateLimited
                | ErrorKind::Auth
                | ErrorKind::ServerError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Config => "CONFIG",
            ErrorKind::TemplateMissingVars => "TEMPLATE_MISSING_VARS",
            ErrorKind::TemplateSyntax => "TEMPLATE_SYNTAX",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::TimeoutQueue => "TIMEOUT_QUEUE",
            ErrorKind::TimeoutTransport => "TIMEOUT_TRANSPORT",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::Auth => "AUTH",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::ContentPolicy => "CONTENT_POLICY",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// The router's error type. Every fallible router operation returns
/// `Result<T, RouterError>`.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[error("{kind}: {message}")]
pub struct RouterError {
    pub kind: ErrorKind,
    pub message: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub correlation_id: Option<String>,
    /// Errors from earlier candidates in the fallback chain, oldest first.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub previous_attempts: Vec<RouterError>,
}

impl RouterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            model: None,
            correlation_id: None,
            previous_attempts: Vec::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach the chain of errors from candidates tried before this one.
    pub fn with_previous_attempts(mut self, attempts: Vec<RouterError>) -> Self {
        self.previous_attempts = attempts;
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "call cancelled")
    }

    pub fn queue_full() -> Self {
        Self::new(ErrorKind::QueueFull, "request queue is at capacity")
    }

    /// Maps this error kind to the HTTP status the admin facade reports it as.
    fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Validation
            | ErrorKind::TemplateMissingVars
            | ErrorKind::TemplateSyntax => StatusCode::BAD_REQUEST,
            ErrorKind::Config => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::TimeoutQueue | ErrorKind::TimeoutTransport => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::ContentPolicy => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::ServerError => StatusCode::BAD_GATEWAY,
            ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Lets admin HTTP handlers return `Result<T, RouterError>` directly.
impl IntoResponse for RouterError {
    fn into_response(self) -> axum::response::Response {
        tracing::warn!(kind = %self.kind, error = %self.message, "router error");
        let status = self.status_code();
        (
            status,
            Json(json!({ "success": false, "error": self.message, "kind": self.kind.to_string() })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec_table() {
        assert!(ErrorKind::TimeoutTransport.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::ContentPolicy.is_retryable());
    }

    #[test]
    fn fallback_kinds_match_spec_table() {
        assert!(ErrorKind::Auth.allows_fallback());
        assert!(ErrorKind::ServerError.allows_fallback());
        assert!(!ErrorKind::Validation.allows_fallback());
        assert!(!ErrorKind::ContentPolicy.allows_fallback());
        assert!(!ErrorKind::QueueFull.allows_fallback());
    }

    #[test]
    fn display_uses_screaming_snake_case() {
        assert_eq!(ErrorKind::TemplateMissingVars.to_string(), "TEMPLATE_MISSING_VARS");
    }
}

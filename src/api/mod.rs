//! Admin/observability HTTP facade.
//!
//! The client-facing REST surface belongs to a separate proxy layer that
//! embeds this crate as a library and calls [`crate::router::Router`]
//! directly — it isn't part of this crate. What remains is an
//! operator-facing facade: health, recent traffic, redacted config, template
//! management, metrics, cost summaries, pricing updates, and queue control.
//! Every handler returns a `{success, data?, error?}` envelope.

pub mod admin;
pub mod admin_auth;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;

use std::sync::Arc;
use std::time::Instant;

use axum::Router as AxumRouter;

use crate::router::Router;

/// Shared state for every admin-facade handler and middleware.
pub struct AdminState {
    pub router: Arc<Router>,
    /// `Some` when `router.admin_token_env` resolves to a non-empty value —
    /// checked by [`admin_auth::admin_auth_middleware`].
    pub admin_token: Option<String>,
    /// Per-IP token bucket, enabled when the config's `admin_rate_limit_rpm`
    /// is set.
    pub rate_limiter: Option<rate_limit::RateLimiter>,
    pub started_at: Instant,
}

impl AdminState {
    pub fn new(router: Arc<Router>, admin_token: Option<String>, rate_limiter: Option<rate_limit::RateLimiter>) -> Self {
        Self { router, admin_token, rate_limiter, started_at: Instant::now() }
    }
}

/// Assemble the admin axum app: `/healthz` plus every `/admin/...` route,
/// layered with auth, per-IP rate limiting, request-id propagation, and
/// tracing — in that order, innermost first. `/healthz` deliberately sits
/// outside the auth/rate-limit layer so it remains an open liveness probe.
pub fn build(state: Arc<AdminState>) -> AxumRouter {
    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let admin_routes = admin::router(state.clone())
        .layer(axum::middleware::from_fn_with_state(state.clone(), admin_auth::admin_auth_middleware))
        .layer(axum::middleware::from_fn_with_state(state.clone(), rate_limit::rate_limit_middleware));

    AxumRouter::new()
        .route("/healthz", axum::routing::get(health::healthz))
        .merge(admin_routes)
        .layer(axum::middleware::from_fn(request_id::request_id_middleware))
        .layer(trace_layer)
}

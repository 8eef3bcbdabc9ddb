//! Prometheus-compatible `/admin/metrics/prometheus` endpoint.
//!
//! Delegates rendering to [`crate::metrics::MetricsSnapshot::to_prometheus_text`]
//! rather than re-deriving counters here, so the text exposition format and
//! the JSON snapshot served at `/admin/metrics` (see `api/admin.rs`) can never
//! drift apart.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use super::AdminState;

/// `GET /admin/metrics/prometheus` — renders Prometheus text format.
pub async fn prometheus(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let body = state.router.get_metrics().to_prometheus_text();
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;

    use crate::adapters::MockAdapter;
    use crate::config::{Config, ConfigStore};
    use crate::registry::Registry;

    async fn test_state() -> StdArc<AdminState> {
        let config = Config {
            router: crate::config::RouterSettings::default(),
            providers: Default::default(),
            rate_limits: Default::default(),
            pricing: Default::default(),
            role_mappings: Default::default(),
            feature_flags: Default::default(),
        };
        let store = StdArc::new(ConfigStore::new(config));
        let registry = StdArc::new(Registry::new());
        registry.register(StdArc::new(MockAdapter::new("mock")));
        let router = crate::router::Router::new(store, registry).await.unwrap();
        StdArc::new(AdminState::new(router, None, None))
    }

    #[tokio::test]
    async fn prometheus_text_includes_calls_total_family() {
        let state = test_state().await;
        state.router.get_metrics();
        let body = state.router.get_metrics().to_prometheus_text();
        assert!(body.contains("model_router_calls_total"));
    }
}

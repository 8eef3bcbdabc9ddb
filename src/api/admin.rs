//! Admin/observability handlers: template management, metrics, cost
//! summaries, pricing updates, and queue control.
//!
//! Every handler returns a `{success, data?, error?}` envelope — on success
//! by wrapping a typed body in [`envelope`]; on failure by returning
//! [`crate::error::RouterError`] directly and letting its `IntoResponse`
//! impl produce the matching `{success: false, ...}` shape and status code —
//! handlers simply propagate with `?`.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router as AxumRouter,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::ModelPricing;
use crate::error::Result;

use super::AdminState;

/// Build the admin-facing route table. Mounted under auth + rate-limit
/// layers by [`super::build`].
pub fn router(state: Arc<AdminState>) -> AxumRouter {
    AxumRouter::new()
        .route("/admin/health", get(health))
        .route("/admin/traffic", get(traffic))
        .route("/admin/config", get(config))
        .route("/admin/templates", get(list_templates))
        .route("/admin/templates/:name", get(get_template))
        .route("/admin/templates/reload", post(reload_templates))
        .route("/admin/metrics", get(metrics))
        .route("/admin/cost/summary", get(cost_summary))
        .route("/admin/cost/pricing", post(update_pricing))
        .route("/admin/queue/pause", post(pause_queue))
        .route("/admin/queue/resume", post(resume_queue))
        .route("/admin/queue/retry", post(retry_queue))
        .route("/admin/queue/clean", post(clean_queue))
        .route("/admin/metrics/prometheus", get(super::metrics::prometheus))
        .with_state(state)
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

/// GET /admin/health — liveness + a snapshot of queue/cache/provider state.
/// Reports `503` (via the envelope's HTTP status, not its body) when the
/// queue is paused, since a paused router cannot serve new calls.
pub async fn health(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let queue = state.router.queue_metrics().await;
    let cache = state.router.cache_stats();
    let providers = state.router.registry().len();
    let paused = state.router.queue_paused();

    let body = json!({
        "status": if paused { "paused" } else { "ok" },
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "providers": providers,
        "queue": queue,
        "cache": cache,
    });

    let status = if paused {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::OK
    };
    (status, Json(json!({ "success": true, "data": body })))
}

#[derive(Deserialize)]
pub struct TrafficQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}
fn default_limit() -> usize {
    100
}

/// GET /admin/traffic?limit=N — recent N traffic entries (default 100).
pub async fn traffic(State(state): State<Arc<AdminState>>, Query(q): Query<TrafficQuery>) -> impl IntoResponse {
    let entries = state.router.traffic().recent(q.limit).await;
    let stats = state.router.traffic().stats().await;
    envelope(json!({ "stats": stats, "entries": entries }))
}

/// GET /admin/config — current config with secrets redacted: provider
/// `api_key_env` names are shown, resolved key values never are.
pub async fn config(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let cfg = state.router.config_store().snapshot().await;

    let providers: Vec<Value> = cfg
        .providers
        .iter()
        .map(|(name, p)| {
            json!({
                "name": name,
                "kind": p.kind.to_string(),
                "base_url": p.base_url,
                "api_key_env": p.api_key_env,
                "enabled": p.enabled,
                "timeout_ms": p.timeout_ms,
            })
        })
        .collect();

    let role_mappings: Value = cfg
        .role_mappings
        .iter()
        .map(|(role, mapping)| {
            (
                role.clone(),
                json!({
                    "primary": mapping.primary,
                    "fallbacks": mapping.fallbacks,
                }),
            )
        })
        .collect::<serde_json::Map<_, _>>()
        .into();

    envelope(json!({
        "router": {
            "admin_port": cfg.router.admin_port,
            "cache_ttl_ms": cfg.router.cache_ttl_ms,
            "queue_max_size": cfg.router.queue_max_size,
            "max_retries": cfg.router.max_retries,
            "admin_token_configured": cfg.router.admin_token_env.is_some(),
        },
        "providers": providers,
        "role_mappings": role_mappings,
        "feature_flags": cfg.feature_flags,
    }))
}

/// GET /admin/templates — list available templates.
pub async fn list_templates(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    envelope(json!({ "templates": state.router.templates().list().await }))
}

/// GET /admin/templates/:name — fetch one template's metadata.
pub async fn get_template(State(state): State<Arc<AdminState>>, Path(name): Path<String>) -> Result<impl IntoResponse> {
    let template = state
        .router
        .templates()
        .get(&name)
        .await
        .ok_or_else(|| crate::error::RouterError::new(crate::error::ErrorKind::Config, format!("unknown template `{name}`")))?;

    Ok(envelope(json!({
        "name": template.name,
        "variables": template.variables,
        "body": template.body,
    })))
}

/// POST /admin/templates/reload — force an immediate reload instead of
/// waiting for the background poll.
pub async fn reload_templates(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let reloaded = state.router.templates().reload_changed().await;
    envelope(json!({ "reloaded": reloaded }))
}

/// GET /admin/metrics — the metrics snapshot, rendered as JSON. Prometheus
/// text scraping is served by [`super::metrics::prometheus`] at
/// `/admin/metrics/prometheus`.
pub async fn metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    envelope(serde_json::to_value(state.router.get_metrics()).unwrap_or(Value::Null))
}

#[derive(Deserialize)]
pub struct CostSummaryQuery {
    #[serde(default = "default_top_n")]
    top_n: usize,
}
fn default_top_n() -> usize {
    5
}

/// GET /admin/cost/summary — totals, per-call averages, top-N by cost per
/// dimension.
pub async fn cost_summary(State(state): State<Arc<AdminState>>, Query(q): Query<CostSummaryQuery>) -> impl IntoResponse {
    envelope(serde_json::to_value(state.router.cost_tracker().get_summary(q.top_n).await).unwrap_or(Value::Null))
}

#[derive(Deserialize)]
pub struct UpdatePricingRequest {
    provider: String,
    model: String,
    input: f64,
    output: f64,
}

/// POST /admin/cost/pricing — update `$/1M tokens` pricing for a
/// provider+model pair.
pub async fn update_pricing(State(state): State<Arc<AdminState>>, Json(req): Json<UpdatePricingRequest>) -> impl IntoResponse {
    state
        .router
        .update_pricing(&req.provider, &req.model, ModelPricing { input: req.input, output: req.output })
        .await;
    envelope(json!({ "provider": req.provider, "model": req.model }))
}

/// POST /admin/queue/pause — reject new calls with `QUEUE_FULL` instead of
/// waiting for a turn.
pub async fn pause_queue(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    state.router.pause_queue();
    envelope(json!({ "paused": true }))
}

/// POST /admin/queue/resume — the inverse of [`pause_queue`].
pub async fn resume_queue(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    state.router.resume_queue();
    envelope(json!({ "paused": false }))
}

/// POST /admin/queue/retry — resume a paused queue so waiting and future
/// callers get a turn again. There is no dead-letter store of failed
/// dispatches to replay (failures already fall back or surface to the
/// caller directly), so "retry a queue" and "resume a queue" resolve to the
/// same underlying action; this endpoint exists as its own verb because an
/// operator reaching for "retry" after a pause shouldn't have to know that.
pub async fn retry_queue(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    state.router.resume_queue();
    envelope(json!({ "paused": false }))
}

/// POST /admin/queue/clean — drop every ticket currently waiting in queue;
/// in-flight dispatches are unaffected.
pub async fn clean_queue(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    state.router.clean_queue().await;
    envelope(json!({ "cleaned": true }))
}

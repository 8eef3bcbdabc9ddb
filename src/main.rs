use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use model_router::adapters::{Adapter, AnthropicAdapter, MockAdapter, OllamaAdapter, OpenAIAdapter};
use model_router::api::{self, AdminState};
use model_router::config::{Config, ConfigStore, ProviderConfig, ProviderKind};
use model_router::registry::Registry;
use model_router::router::Router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Invoked as a container HEALTHCHECK: hit /healthz and exit immediately,
    // avoiding the need for curl/wget in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_router=info,tower_http=warn".into()),
        )
        .init();

    let config_path = std::env::var("MODEL_ROUTER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/model-router/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(admin_port = config.router.admin_port, providers = config.providers.len(), "model-router starting");

    let registry = Arc::new(Registry::new());
    for (name, provider_cfg) in &config.providers {
        if !provider_cfg.enabled {
            info!(provider = %name, "provider disabled — not registering an adapter");
            continue;
        }
        registry.register(build_adapter(name, provider_cfg));
    }

    let config_store = Arc::new(ConfigStore::new(config));
    let router = Router::new(config_store, registry).await.context("failed to initialize router")?;

    tokio::spawn(config_watcher(router.clone(), config_path.clone()));

    let snapshot = router.config_store().snapshot().await;
    let admin_token = snapshot.router.admin_token_env.as_deref().and_then(|var| std::env::var(var).ok());
    let admin_rate_limiter = snapshot.router.admin_rate_limit_rpm.map(api::rate_limit::RateLimiter::new);
    let admin_port = snapshot.router.admin_port;
    drop(snapshot);

    let state = Arc::new(AdminState::new(router.clone(), admin_token, admin_rate_limiter));
    let app = api::build(state);

    let addr: SocketAddr = format!("0.0.0.0:{admin_port}").parse()?;
    info!(%addr, "admin API listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    router.shutdown();
    Ok(())
}

/// Construct the adapter for one configured provider, resolving its API key
/// from the environment. [`AnthropicAdapter`] requires a key up front (the
/// wire protocol rejects unauthenticated requests outright); providers with
/// no `api_key_env` configured fall back to an empty string so a keyless
/// local deployment (e.g. a firewalled Anthropic-compatible gateway) can
/// still start, deferring the actual auth failure to the first call.
fn build_adapter(name: &str, cfg: &ProviderConfig) -> Arc<dyn Adapter> {
    match cfg.kind {
        ProviderKind::OpenAi => {
            Arc::new(OpenAIAdapter::new(name, cfg.base_url.clone(), cfg.timeout_ms, cfg.api_key()))
        }
        ProviderKind::Anthropic => {
            Arc::new(AnthropicAdapter::new(name, cfg.base_url.clone(), cfg.timeout_ms, cfg.api_key().unwrap_or_default()))
        }
        ProviderKind::Ollama => Arc::new(OllamaAdapter::new(name, cfg.base_url.clone(), cfg.timeout_ms)),
        ProviderKind::Mock => Arc::new(MockAdapter::new(name)),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `model-router-admin --healthcheck`.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("MODEL_ROUTER_ADMIN_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8089);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change. Uses filesystem `mtime` for change detection, the same idiom the
/// template manager's own background watcher uses.
async fn config_watcher(router: Arc<Router>, path: PathBuf) {
    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(&path) {
            Ok(new_config) => {
                router.config_store().replace(new_config).await;
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}

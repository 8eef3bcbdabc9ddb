//! Router configuration (spec §3/§4.10/§6).
//!
//! Loaded once from TOML at startup (teacher: `Config::load`). Unlike the
//! teacher's config — which callers mutate only via whole-file hot reload —
//! this configuration also exposes a typed runtime update API
//! (`update_pricing`, `set_feature_flag`, `set_role_mapping`) behind a single
//! writer lock, with every mutation observable through a change broadcast so
//! the cache and trackers can react (spec §4.10, §9 "every mutation is
//! observable through a change callback").

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::types::Candidate;

/// Which wire protocol a provider adapter speaks.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Anthropic,
    Ollama,
    /// Deterministic stub adapter used in tests (spec §8 testable property 8
    /// requires a deterministic stub provider for streaming-consistency tests).
    Mock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        })
    }
}

/// Per-provider connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,

    /// Base URL — must end without a trailing `/v1` (added by the adapter).
    #[serde(default)]
    pub base_url: String,

    /// Environment variable name whose value is the API key. Leave unset for
    /// keyless local providers (e.g. Ollama with no auth, or the mock adapter).
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request timeout in milliseconds (default: 30 000).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Whether this provider is eligible for dispatch. A disabled provider is
    /// skipped as if unregistered — useful for taking a provider out of
    /// rotation without editing every role mapping that references it.
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl ProviderConfig {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env.as_deref().and_then(|var| std::env::var(var).ok())
    }
}

/// Per-provider rate-limit settings (spec §4.3 rate limiter).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Maximum number of concurrent in-flight calls to this provider.
    pub max_concurrent: u32,

    /// Minimum spacing between dispatches to this provider, in milliseconds.
    #[serde(default)]
    pub min_time_ms: u64,

    /// Optional token-bucket reservoir size. `None` disables the reservoir
    /// and only the concurrency cap and `min_time_ms` apply.
    pub reservoir: Option<u32>,

    /// Tokens added back to the reservoir every `interval_ms`.
    pub refill_per_interval: Option<u32>,

    #[serde(default = "defaults::interval_ms")]
    pub interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            min_time_ms: 0,
            reservoir: None,
            refill_per_interval: None,
            interval_ms: defaults::interval_ms(),
        }
    }
}

/// `$/1M tokens` pricing for one model (spec §3 Pricing).
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

/// `role -> { primary, fallbacks }` (spec §3 Role mapping).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleMapping {
    pub primary: Candidate,
    #[serde(default)]
    pub fallbacks: Vec<Candidate>,
}

impl RoleMapping {
    /// `[primary] ++ fallbacks`, the dispatch order for spec §4.11 step 6.
    pub fn candidates(&self) -> Vec<Candidate> {
        let mut v = Vec::with_capacity(1 + self.fallbacks.len());
        v.push(self.primary.clone());
        v.extend(self.fallbacks.iter().cloned());
        v
    }
}

/// Core router settings (teacher: `GatewayConfig`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterSettings {
    /// Default cache TTL in milliseconds (spec §4.5).
    #[serde(default = "defaults::cache_ttl_ms")]
    pub cache_ttl_ms: u64,

    /// Cap on the number of cached entries (LRU eviction beyond this). `None`
    /// means TTL is the only eviction pressure.
    #[serde(default)]
    pub cache_max_entries: Option<u64>,

    /// Bounded queue capacity per spec §4.4. Enqueue past this returns
    /// `QUEUE_FULL`.
    #[serde(default = "defaults::queue_max_size")]
    pub queue_max_size: usize,

    /// How long a request may wait in queue before `TIMEOUT_QUEUE`.
    #[serde(default = "defaults::queue_wait_timeout_ms")]
    pub queue_wait_timeout_ms: u64,

    /// Additional attempts after the first failure, per candidate
    /// (default: 2, mirrors teacher's `max_retries`).
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Initial delay between retry attempts in milliseconds. Doubles per
    /// attempt, capped by the retry backoff ceiling.
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Directory templates are loaded from and hot-reloaded out of (spec §4.6).
    #[serde(default)]
    pub template_dir: Option<std::path::PathBuf>,

    /// Port for the admin/observability facade (teacher: `admin_port`).
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Environment variable whose value is the Bearer token required for
    /// admin API requests. Unset disables admin authentication.
    #[serde(default)]
    pub admin_token_env: Option<String>,

    /// Per-IP requests-per-minute cap on the admin facade. Unset disables
    /// rate limiting on admin routes (teacher: `rate_limit_rpm`).
    #[serde(default)]
    pub admin_rate_limit_rpm: Option<u32>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            cache_ttl_ms: defaults::cache_ttl_ms(),
            cache_max_entries: None,
            queue_max_size: defaults::queue_max_size(),
            queue_wait_timeout_ms: defaults::queue_wait_timeout_ms(),
            max_retries: defaults::max_retries(),
            retry_delay_ms: defaults::retry_delay_ms(),
            template_dir: None,
            admin_port: defaults::admin_port(),
            admin_token_env: None,
            admin_rate_limit_rpm: None,
        }
    }
}

/// Top-level configuration (spec §6 "Configuration inputs").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterSettings,

    /// Named providers (OpenAI, Anthropic, Ollama, mock, etc.).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Per-provider rate limits. A provider with no entry uses
    /// [`RateLimitConfig::default`].
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,

    /// `provider -> model -> pricing`.
    #[serde(default)]
    pub pricing: HashMap<String, HashMap<String, ModelPricing>>,

    /// `role -> { primary, fallbacks }` — the dispatch chain a call resolves
    /// to (spec §4.11 step 2).
    #[serde(default)]
    pub role_mappings: HashMap<String, RoleMapping>,

    /// Named boolean switches, settable at runtime (spec §6
    /// `SetFeatureFlag`).
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (role, mapping) in &self.role_mappings {
            anyhow::ensure!(
                self.providers.contains_key(&mapping.primary.provider),
                "role `{role}` primary references unknown provider `{}`",
                mapping.primary.provider
            );
            for fallback in &mapping.fallbacks {
                anyhow::ensure!(
                    self.providers.contains_key(&fallback.provider),
                    "role `{role}` fallback references unknown provider `{}`",
                    fallback.provider
                );
            }
        }
        Ok(())
    }

    pub fn cost_per_million(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        self.pricing.get(provider).and_then(|models| models.get(model)).copied()
    }

    pub fn role(&self, role: &str) -> Option<&RoleMapping> {
        self.role_mappings.get(role)
    }

    pub fn rate_limit(&self, provider: &str) -> RateLimitConfig {
        self.rate_limits.get(provider).cloned().unwrap_or_default()
    }

    pub fn feature_flag(&self, name: &str) -> bool {
        self.feature_flags.get(name).copied().unwrap_or(false)
    }
}

mod defaults {
    pub fn timeout_ms() -> u64 { 30_000 }
    pub fn enabled() -> bool { true }
    pub fn interval_ms() -> u64 { 1_000 }
    pub fn cache_ttl_ms() -> u64 { 300_000 }
    pub fn queue_max_size() -> usize { 1_000 }
    pub fn queue_wait_timeout_ms() -> u64 { 30_000 }
    pub fn max_retries() -> u32 { 2 }
    pub fn retry_delay_ms() -> u64 { 200 }
    pub fn admin_port() -> u16 { 8089 }
}

/// Describes what changed, for subscribers of [`ConfigStore::subscribe`].
#[derive(Debug, Clone)]
pub enum ConfigChange {
    PricingUpdated { provider: String, model: String },
    FeatureFlagChanged { name: String, value: bool },
    RoleMappingChanged { role: String },
    Reloaded,
}

/// Shared, hot-mutable configuration handle.
///
/// Reads take a cheap `Arc` snapshot (teacher: `RouterState::config`'s lock
/// held only for the duration of `Arc::clone`). Writes go through a single
/// async write lock and broadcast a [`ConfigChange`] so dependents (cache,
/// trackers) can react without polling.
pub struct ConfigStore {
    inner: RwLock<std::sync::Arc<Config>>,
    changes: broadcast::Sender<ConfigChange>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self { inner: RwLock::new(std::sync::Arc::new(config)), changes }
    }

    /// A stable snapshot of the current config.
    pub async fn snapshot(&self) -> std::sync::Arc<Config> {
        self.inner.read().await.clone()
    }

    /// Subscribe to configuration change notifications. A lagging subscriber
    /// misses intermediate events but never blocks writers.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.changes.subscribe()
    }

    /// Atomically replace the whole config (teacher: hot-reload path,
    /// `config_watcher`).
    pub async fn replace(&self, config: Config) {
        *self.inner.write().await = std::sync::Arc::new(config);
        let _ = self.changes.send(ConfigChange::Reloaded);
    }

    pub async fn update_pricing(&self, provider: &str, model: &str, pricing: ModelPricing) {
        let mut guard = self.inner.write().await;
        let mut next = (**guard).clone();
        next.pricing.entry(provider.to_string()).or_default().insert(model.to_string(), pricing);
        *guard = std::sync::Arc::new(next);
        let _ = self.changes.send(ConfigChange::PricingUpdated {
            provider: provider.to_string(),
            model: model.to_string(),
        });
    }

    pub async fn set_feature_flag(&self, name: &str, value: bool) {
        let mut guard = self.inner.write().await;
        let mut next = (**guard).clone();
        next.feature_flags.insert(name.to_string(), value);
        *guard = std::sync::Arc::new(next);
        let _ = self.changes.send(ConfigChange::FeatureFlagChanged {
            name: name.to_string(),
            value,
        });
    }

    pub async fn set_role_mapping(&self, role: &str, mapping: RoleMapping) {
        let mut guard = self.inner.write().await;
        let mut next = (**guard).clone();
        next.role_mappings.insert(role.to_string(), mapping);
        *guard = std::sync::Arc::new(next);
        let _ = self.changes.send(ConfigChange::RoleMappingChanged { role: role.to_string() });
    }
}

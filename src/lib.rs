//! Model router: the multi-provider LLM dispatch core.
//!
//! Callers resolve a logical *role* (e.g. `"clarifier"`) to a concrete
//! provider+model pair, with automatic queueing, per-provider rate limiting,
//! response caching, retry/fallback, and cost/token/metrics tracking. The
//! crate ships as a library — [`Router`] is the entry point — plus a thin
//! `model-router-admin` binary exposing an observability/operator HTTP
//! facade over the same [`Router`] instance (`src/api`, `src/main.rs`).
//!
//! ```no_run
//! use std::sync::Arc;
//! use model_router::adapters::MockAdapter;
//! use model_router::config::{Config, ConfigStore};
//! use model_router::registry::Registry;
//! use model_router::router::Router;
//! use model_router::types::{CallOptions, ChatMessage};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load("config.toml".as_ref())?;
//! let registry = Arc::new(Registry::new());
//! registry.register(Arc::new(MockAdapter::new("mock")));
//!
//! let router = Router::new(Arc::new(ConfigStore::new(config)), registry).await?;
//! let response = router
//!     .call("clarifier", vec![ChatMessage::user("hi")], CallOptions::default(), CancellationToken::new())
//!     .await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod api;
pub mod cache;
pub mod config;
pub mod cost_tracker;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod rate_limiter;
pub mod registry;
pub mod router;
pub mod templates;
pub mod token_tracker;
pub mod traffic;
pub mod types;

pub use config::{Config, ConfigStore};
pub use error::{ErrorKind, Result, RouterError};
pub use router::Router;

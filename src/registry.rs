//! Provider registry (spec §4.2).
//!
//! Adapters are registered once at startup — typically from `main.rs`
//! reading [`crate::config::Config::providers`] — then looked up by name on
//! every call. Unlike the teacher's `BackendClient::new`, which builds a
//! fresh adapter inline per request from a closed enum, the registry holds
//! long-lived `Arc<dyn Adapter>` instances so a provider can be swapped or
//! added at runtime (spec §6 `RegisterProvider`) without restarting the
//! process.

use std::sync::Arc;

use dashmap::DashMap;

use crate::adapters::Adapter;
use crate::error::{ErrorKind, Result, RouterError};

/// One-shot-registration, O(1)-lookup provider registry.
#[derive(Default)]
pub struct Registry {
    adapters: DashMap<String, Arc<dyn Adapter>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { adapters: DashMap::new() }
    }

    /// Register an adapter under its own `name()`. Replaces any adapter
    /// previously registered under the same name — this is how a live
    /// config reload swaps a provider's adapter without downtime.
    pub fn register(&self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    /// Look up a provider by name, or `CONFIG` if it was never registered.
    pub fn get(&self, provider: &str) -> Result<Arc<dyn Adapter>> {
        self.adapters
            .get(provider)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                RouterError::new(ErrorKind::Config, format!("unknown provider `{provider}`"))
                    .with_provider(provider)
            })
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.adapters.contains_key(provider)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;

    #[test]
    fn get_returns_config_error_for_unknown_provider() {
        let registry = Registry::new();
        let err = registry.get("ghost").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn register_then_get_round_trips_by_name() {
        let registry = Registry::new();
        registry.register(Arc::new(MockAdapter::new("p1")));
        assert!(registry.get("p1").is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registering_same_name_twice_replaces_the_adapter() {
        let registry = Registry::new();
        registry.register(Arc::new(MockAdapter::new("p1")));
        registry.register(Arc::new(MockAdapter::new("p1")));
        assert_eq!(registry.len(), 1);
    }
}

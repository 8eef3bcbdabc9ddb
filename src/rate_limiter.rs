//! Per-provider rate limiting (spec §4.3).
//!
//! Generalizes the teacher's per-IP token bucket (`api/rate_limit.rs`) from a
//! single fractional-refill bucket keyed by `IpAddr` to three composable
//! limits keyed by provider name: a concurrency cap (`tokio::sync::Semaphore`),
//! a minimum dispatch spacing (`min_time_ms`), and an optional token-bucket
//! reservoir refilled by elapsed time — the same "refill based on elapsed
//! time" idiom as the teacher's `RateLimiter::check`, rather than a
//! periodic-tick design.
//!
//! Dropping the returned [`Permit`] releases the concurrency slot
//! immediately; cancelling the future awaiting [`RateLimiter::acquire`] has
//! the same effect since the semaphore permit is never leaked.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::RateLimitConfig;
use crate::error::{ErrorKind, Result, RouterError};

struct Reservoir {
    tokens: f64,
    last_refill: Instant,
}

struct ProviderState {
    semaphore: Arc<Semaphore>,
    last_dispatch: Mutex<Option<Instant>>,
    reservoir: Option<Mutex<Reservoir>>,
    config: RateLimitConfig,
}

/// Held for the duration of one dispatch attempt. Dropping it frees the
/// provider's concurrency slot.
pub struct Permit {
    _semaphore: OwnedSemaphorePermit,
}

#[derive(Default)]
pub struct RateLimiter {
    providers: DashMap<String, Arc<ProviderState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self { providers: DashMap::new() }
    }

    /// Install (or replace) the rate-limit settings for a provider. Existing
    /// in-flight permits are unaffected; new settings take effect for
    /// subsequent `acquire` calls.
    pub fn configure(&self, provider: &str, config: RateLimitConfig) {
        let state = Arc::new(ProviderState {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            last_dispatch: Mutex::new(None),
            reservoir: config.reservoir.map(|cap| {
                Mutex::new(Reservoir { tokens: cap as f64, last_refill: Instant::now() })
            }),
            config,
        });
        self.providers.insert(provider.to_string(), state);
    }

    fn state_for(&self, provider: &str) -> Arc<ProviderState> {
        self.providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderState {
                semaphore: Arc::new(Semaphore::new(RateLimitConfig::default().max_concurrent as usize)),
                last_dispatch: Mutex::new(None),
                reservoir: None,
                config: RateLimitConfig::default(),
            }))
            .clone()
    }

    /// Acquire a dispatch slot for `provider`, respecting its concurrency
    /// cap, minimum spacing, and reservoir in that order. Blocks (without
    /// holding any lock across the wait) until all three admit the call.
    pub async fn acquire(&self, provider: &str) -> Result<Permit> {
        let state = self.state_for(provider);

        let semaphore_permit = state.semaphore.clone().acquire_owned().await.map_err(|_| {
            RouterError::new(ErrorKind::Internal, "rate limiter semaphore closed")
                .with_provider(provider)
        })?;

        if state.config.min_time_ms > 0 {
            let wait = {
                let mut last = state.last_dispatch.lock().await;
                let now = Instant::now();
                let wait = last
                    .map(|prev| {
                        let min_gap = Duration::from_millis(state.config.min_time_ms);
                        let elapsed = now.duration_since(prev);
                        min_gap.saturating_sub(elapsed)
                    })
                    .unwrap_or_default();
                *last = Some(now + wait);
                wait
            };
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }

        if let Some(reservoir) = &state.reservoir {
            self.wait_for_reservoir(reservoir, &state.config).await;
        }

        Ok(Permit { _semaphore: semaphore_permit })
    }

    async fn wait_for_reservoir(&self, reservoir: &Mutex<Reservoir>, config: &RateLimitConfig) {
        let refill_rate = config.refill_per_interval.unwrap_or(0) as f64
            / (config.interval_ms.max(1) as f64 / 1000.0);
        loop {
            let wait_for = {
                let mut guard = reservoir.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
                let cap = config.reservoir.unwrap_or(0) as f64;
                let refreshed = (guard.tokens + elapsed * refill_rate).min(cap);
                guard.last_refill = now;

                if refreshed >= 1.0 {
                    guard.tokens = refreshed - 1.0;
                    None
                } else {
                    guard.tokens = refreshed;
                    let deficit = 1.0 - refreshed;
                    let secs = if refill_rate > 0.0 { deficit / refill_rate } else { 1.0 };
                    Some(Duration::from_secs_f64(secs.max(0.001)))
                }
            };

            match wait_for {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concurrency_cap_limits_simultaneous_permits() {
        let limiter = RateLimiter::new();
        limiter.configure("p", RateLimitConfig { max_concurrent: 1, ..RateLimitConfig::default() });

        let first = limiter.acquire("p").await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), limiter.acquire("p")).await;
        assert!(second.is_err(), "second acquire should not complete while first permit is held");
        drop(first);

        let third = tokio::time::timeout(Duration::from_millis(200), limiter.acquire("p")).await;
        assert!(third.is_ok(), "releasing the first permit should admit a new one");
    }

    #[tokio::test]
    async fn unconfigured_provider_uses_default_limits() {
        let limiter = RateLimiter::new();
        assert!(limiter.acquire("unconfigured").await.is_ok());
    }

    #[tokio::test]
    async fn min_time_spacing_delays_back_to_back_acquires() {
        let limiter = RateLimiter::new();
        limiter.configure(
            "p",
            RateLimitConfig { max_concurrent: 10, min_time_ms: 50, ..RateLimitConfig::default() },
        );

        let start = Instant::now();
        drop(limiter.acquire("p").await.unwrap());
        drop(limiter.acquire("p").await.unwrap());
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn reservoir_blocks_once_exhausted_until_refill() {
        let limiter = RateLimiter::new();
        limiter.configure(
            "p",
            RateLimitConfig {
                max_concurrent: 10,
                reservoir: Some(1),
                refill_per_interval: Some(1),
                interval_ms: 50,
                ..RateLimitConfig::default()
            },
        );

        drop(limiter.acquire("p").await.unwrap());
        let result = tokio::time::timeout(Duration::from_millis(200), limiter.acquire("p")).await;
        assert!(result.is_ok(), "reservoir should refill within the interval");
    }
}

//! Metrics collector (spec §4.9).
//!
//! Generalizes the teacher's `api/metrics.rs` — which renders Prometheus
//! text by replaying the `TrafficLog` ring buffer on every scrape — into
//! proper running counters and latency histograms keyed by `(provider,
//! role)`, snapshotted on demand. Counters avoid the ring buffer's "values
//! can decrease as old entries rotate out" caveat: these are lifetime
//! totals until [`MetricsCollector`] is dropped or the process restarts, per
//! spec §3 "Cost/metric aggregates grow monotonically until explicit reset."
//! `Router` still renders a Prometheus-text view from [`Snapshot`] for the
//! admin facade, matching the teacher's wire format.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Upper bounds (inclusive) of each histogram bucket, in milliseconds.
/// Mirrors a typical Prometheus default ladder scaled for LLM-call latency.
const BUCKET_BOUNDS_MS: &[u64] = &[10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

struct Histogram {
    buckets: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: (0..=BUCKET_BOUNDS_MS.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value_ms: u64) {
        let idx = BUCKET_BOUNDS_MS.iter().position(|&bound| value_ms <= bound).unwrap_or(BUCKET_BOUNDS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        // Cumulative counts, matching Prometheus histogram `le` bucket semantics.
        let mut cumulative = Vec::with_capacity(self.buckets.len());
        let mut running = 0u64;
        for (i, bound) in BUCKET_BOUNDS_MS.iter().enumerate() {
            running += self.buckets[i].load(Ordering::Relaxed);
            cumulative.push((*bound, running));
        }
        running += self.buckets[BUCKET_BOUNDS_MS.len()].load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: cumulative,
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
            count: running,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// `(upper_bound_ms, cumulative_count)` pairs, plus an implicit `+Inf`
    /// bucket whose count is `count`.
    pub buckets: Vec<(u64, u64)>,
    pub sum_ms: u64,
    pub count: u64,
}

impl HistogramSnapshot {
    pub fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.count as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    calls_total: AtomicU64,
    calls_success: AtomicU64,
    calls_failed: AtomicU64,
    retries_total: AtomicU64,
    fallback_activations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cancelled: AtomicU64,
}

struct ProviderRoleMetrics {
    counters: Counters,
    queue_wait_ms: Histogram,
    dispatch_latency_ms: Histogram,
}

impl ProviderRoleMetrics {
    fn new() -> Self {
        Self { counters: Counters::default(), queue_wait_ms: Histogram::new(), dispatch_latency_ms: Histogram::new() }
    }
}

/// Snapshot of one `(provider, role)` bucket, per spec §4.9's listed fields.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsBucketSnapshot {
    pub provider: String,
    pub role: String,
    pub calls_total: u64,
    pub calls_success: u64,
    pub calls_failed: u64,
    pub retries_total: u64,
    pub fallback_activations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cancelled: u64,
    pub queue_wait_ms: HistogramSnapshot,
    pub dispatch_latency_ms: HistogramSnapshot,
}

/// Immutable export of every bucket, returned by [`MetricsCollector::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub buckets: Vec<MetricsBucketSnapshot>,
}

impl MetricsSnapshot {
    /// Render as Prometheus text exposition format for the admin `/metrics`
    /// endpoint (teacher: `api/metrics.rs`'s hand-rolled renderer).
    pub fn to_prometheus_text(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str("# HELP model_router_calls_total Total calls attempted, by provider and role.\n");
        out.push_str("# TYPE model_router_calls_total counter\n");
        for bucket in &self.buckets {
            out.push_str(&format!(
                "model_router_calls_total{{provider=\"{}\",role=\"{}\"}} {}\n",
                bucket.provider, bucket.role, bucket.calls_total
            ));
        }
        out.push('\n');

        out.push_str("# HELP model_router_calls_failed_total Failed calls, by provider and role.\n");
        out.push_str("# TYPE model_router_calls_failed_total counter\n");
        for bucket in &self.buckets {
            out.push_str(&format!(
                "model_router_calls_failed_total{{provider=\"{}\",role=\"{}\"}} {}\n",
                bucket.provider, bucket.role, bucket.calls_failed
            ));
        }
        out.push('\n');

        out.push_str("# HELP model_router_dispatch_latency_ms_sum Sum of provider dispatch latency.\n");
        out.push_str("# TYPE model_router_dispatch_latency_ms_sum counter\n");
        for bucket in &self.buckets {
            out.push_str(&format!(
                "model_router_dispatch_latency_ms_sum{{provider=\"{}\",role=\"{}\"}} {}\n",
                bucket.provider, bucket.role, bucket.dispatch_latency_ms.sum_ms
            ));
        }
        out
    }
}

/// In-memory counters + latency histograms, keyed by `(provider, role)`
/// (spec §4.9).
#[derive(Default)]
pub struct MetricsCollector {
    buckets: DashMap<(String, String), ProviderRoleMetrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self { buckets: DashMap::new() }
    }

    fn bucket(&self, provider: &str, role: &str) -> dashmap::mapref::one::Ref<'_, (String, String), ProviderRoleMetrics> {
        let key = (provider.to_string(), role.to_string());
        if !self.buckets.contains_key(&key) {
            self.buckets.entry(key.clone()).or_insert_with(ProviderRoleMetrics::new);
        }
        self.buckets.get(&key).expect("just inserted")
    }

    pub fn record_success(&self, provider: &str, role: &str, dispatch_latency_ms: u64) {
        let bucket = self.bucket(provider, role);
        bucket.counters.calls_total.fetch_add(1, Ordering::Relaxed);
        bucket.counters.calls_success.fetch_add(1, Ordering::Relaxed);
        bucket.dispatch_latency_ms.observe(dispatch_latency_ms);
    }

    pub fn record_failure(&self, provider: &str, role: &str, dispatch_latency_ms: u64) {
        let bucket = self.bucket(provider, role);
        bucket.counters.calls_total.fetch_add(1, Ordering::Relaxed);
        bucket.counters.calls_failed.fetch_add(1, Ordering::Relaxed);
        bucket.dispatch_latency_ms.observe(dispatch_latency_ms);
    }

    pub fn record_cancelled(&self, provider: &str, role: &str) {
        let bucket = self.bucket(provider, role);
        bucket.counters.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, provider: &str, role: &str) {
        self.bucket(provider, role).counters.retries_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, provider: &str, role: &str) {
        self.bucket(provider, role).counters.fallback_activations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self, provider: &str, role: &str) {
        self.bucket(provider, role).counters.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, provider: &str, role: &str) {
        self.bucket(provider, role).counters.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_wait(&self, provider: &str, role: &str, wait_ms: u64) {
        self.bucket(provider, role).queue_wait_ms.observe(wait_ms);
    }

    /// `Snapshot()` — an immutable export for admin/observability consumers
    /// (spec §4.9 "exposes a snapshot").
    pub fn snapshot(&self) -> MetricsSnapshot {
        let buckets = self
            .buckets
            .iter()
            .map(|entry| {
                let (provider, role) = entry.key().clone();
                let m = entry.value();
                MetricsBucketSnapshot {
                    provider,
                    role,
                    calls_total: m.counters.calls_total.load(Ordering::Relaxed),
                    calls_success: m.counters.calls_success.load(Ordering::Relaxed),
                    calls_failed: m.counters.calls_failed.load(Ordering::Relaxed),
                    retries_total: m.counters.retries_total.load(Ordering::Relaxed),
                    fallback_activations: m.counters.fallback_activations.load(Ordering::Relaxed),
                    cache_hits: m.counters.cache_hits.load(Ordering::Relaxed),
                    cache_misses: m.counters.cache_misses.load(Ordering::Relaxed),
                    cancelled: m.counters.cancelled.load(Ordering::Relaxed),
                    queue_wait_ms: m.queue_wait_ms.snapshot(),
                    dispatch_latency_ms: m.dispatch_latency_ms.snapshot(),
                }
            })
            .collect();
        MetricsSnapshot { buckets }
    }

    /// Error-rate view: `(provider, role) -> calls_failed / calls_total`.
    pub fn error_rates(&self) -> HashMap<(String, String), f64> {
        self.buckets
            .iter()
            .map(|entry| {
                let total = entry.value().counters.calls_total.load(Ordering::Relaxed);
                let failed = entry.value().counters.calls_failed.load(Ordering::Relaxed);
                let rate = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
                (entry.key().clone(), rate)
            })
            .collect()
    }
}

//! In-memory traffic log exposed through the admin facade.
//!
//! [`TrafficLog`] is a fixed-capacity ring-buffer: once full, the oldest entry
//! is evicted to make room for the newest. This gives a bounded, O(1) memory
//! footprint regardless of request volume. Unlike the cost/token trackers —
//! which aggregate forever — this is strictly a recent-activity view for
//! `/admin/traffic`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Fixed-capacity ring-buffer of recent [`TrafficEntry`] records.
///
/// Safe to share across threads via `Arc<TrafficLog>`. [`push`][Self::push] uses
/// a non-blocking `try_lock` so it never delays request handling; in the
/// unlikely event of lock contention the entry is silently dropped.
pub struct TrafficLog {
    capacity: usize,
    entries: Mutex<VecDeque<TrafficEntry>>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// Record a completed (or failed) call. Best-effort, non-blocking: if the
    /// mutex is contended the entry is dropped rather than blocking the call path.
    pub fn push(&self, entry: TrafficEntry) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry);
        }
    }

    /// Return up to `limit` recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> TrafficStats {
        let entries = self.entries.lock().await;
        let total = entries.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            entries.iter().map(|e| e.latency_ms as f64).sum::<f64>() / total as f64
        };

        let error_count = entries.iter().filter(|e| !e.success).count();
        let cache_hit_count = entries.iter().filter(|e| e.cached).count();
        let fallback_count = entries.iter().filter(|e| e.fallback_activated).count();

        let mut role_counts: HashMap<String, usize> = HashMap::new();
        let mut provider_counts: HashMap<String, usize> = HashMap::new();
        for entry in entries.iter() {
            *role_counts.entry(entry.role.clone()).or_default() += 1;
            *provider_counts.entry(entry.provider.clone()).or_default() += 1;
        }

        TrafficStats {
            total_requests: total,
            error_count,
            cache_hit_count,
            fallback_count,
            avg_latency_ms,
            role_counts,
            provider_counts,
        }
    }
}

/// A single call record, populated from a [`crate::router::Router`] call outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub provider: String,
    pub model: String,
    /// Whether this call fell back to a non-primary candidate.
    pub fallback_activated: bool,
    /// Whether the response was served from cache.
    pub cached: bool,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    /// `ErrorKind` as a string, set only when `success` is `false`.
    pub error: Option<String>,
}

impl TrafficEntry {
    pub fn new(role: String, provider: String, model: String, latency_ms: u64, success: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            role,
            provider,
            model,
            fallback_activated: false,
            cached: false,
            cost: 0.0,
            latency_ms,
            success,
            error: None,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn mark_cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn mark_fallback_activated(mut self) -> Self {
        self.fallback_activated = true;
        self
    }

    pub fn with_error(mut self, kind: &str) -> Self {
        self.error = Some(kind.to_string());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct TrafficStats {
    pub total_requests: usize,
    pub error_count: usize,
    pub cache_hit_count: usize,
    pub fallback_count: usize,
    pub avg_latency_ms: f64,
    pub role_counts: HashMap<String, usize>,
    pub provider_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_entry(role: &str, provider: &str, latency_ms: u64) -> TrafficEntry {
        TrafficEntry::new(role.into(), provider.into(), "m".into(), latency_ms, true)
    }

    #[tokio::test]
    async fn push_and_retrieve_single_entry() {
        let log = TrafficLog::new(10);
        log.push(make_entry("clarifier", "openai", 42));

        let recent = log.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].role, "clarifier");
        assert_eq!(recent[0].latency_ms, 42);
    }

    #[tokio::test]
    async fn recent_returns_entries_newest_first() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", "p", 1));
        log.push(make_entry("b", "p", 2));
        log.push(make_entry("c", "p", 3));

        let recent = log.recent(10).await;
        assert_eq!(recent[0].role, "c");
        assert_eq!(recent[1].role, "b");
        assert_eq!(recent[2].role, "a");
    }

    #[tokio::test]
    async fn oldest_entry_evicted_when_capacity_exceeded() {
        let log = TrafficLog::new(3);
        log.push(make_entry("oldest", "p", 1));
        log.push(make_entry("middle", "p", 2));
        log.push(make_entry("newest", "p", 3));
        log.push(make_entry("extra", "p", 4));

        let all = log.recent(100).await;
        assert_eq!(all.len(), 3);
        assert!(!all.iter().any(|e| e.role == "oldest"));
        assert!(all.iter().any(|e| e.role == "extra"));
    }

    #[tokio::test]
    async fn stats_on_empty_log() {
        let log = TrafficLog::new(10);
        let stats = log.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.avg_latency_ms, 0.0);
        assert!(stats.role_counts.is_empty());
    }

    #[tokio::test]
    async fn stats_count_cache_hits_and_fallbacks() {
        let log = TrafficLog::new(10);
        log.push(make_entry("a", "p1", 10).mark_cached());
        log.push(make_entry("a", "p2", 20).mark_fallback_activated());
        log.push(make_entry("a", "p1", 30));

        let stats = log.stats().await;
        assert_eq!(stats.cache_hit_count, 1);
        assert_eq!(stats.fallback_count, 1);
        assert_eq!(stats.provider_counts["p1"], 2);
    }

    #[test]
    fn entry_has_unique_ids() {
        let a = make_entry("r", "p", 1);
        let b = make_entry("r", "p", 1);
        assert_ne!(a.id, b.id);
    }
}

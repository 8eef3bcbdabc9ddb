//! Cost tracker (spec §4.7).
//!
//! Every completed call — success or failure — is appended to a raw ledger
//! and folded into four aggregate roll-ups (total, by-provider/by-model,
//! by-project/by-provider, by-role/by-provider) under a single lock, so the
//! roll-ups are always consistent with the ledger (spec: "all aggregates
//! update atomically with the raw record insertion"). A `tokio::sync::Mutex`
//! plays the role the teacher gives `RwLock<Arc<Config>>` elsewhere in this
//! crate: one lock, held briefly, rather than per-bucket locks — the ledger
//! and four roll-ups must move together so splitting them across locks would
//! only reintroduce the races atomicity is meant to rule out.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::types::TokenUsage;

/// One recorded call (spec §4.7 "Records every call with ...").
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub provider: String,
    pub model: String,
    pub role: String,
    pub project_id: Option<String>,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
}

/// Filters accepted by [`CostTracker::get_costs`] / [`CostTracker::get_call_history`].
#[derive(Debug, Clone, Default)]
pub struct CostFilters {
    pub provider: Option<String>,
    pub project: Option<String>,
    pub role: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl CostFilters {
    fn matches(&self, record: &CallRecord) -> bool {
        if let Some(p) = &self.provider {
            if &record.provider != p {
                return false;
            }
        }
        if let Some(p) = &self.project {
            if record.project_id.as_deref() != Some(p.as_str()) {
                return false;
            }
        }
        if let Some(r) = &self.role {
            if &record.role != r {
                return false;
            }
        }
        if let Some(start) = self.start_date {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if record.timestamp > end {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    None,
    Provider,
    Project,
    Role,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct DimensionTotals {
    pub cost: f64,
    pub calls: u64,
    pub tokens: u64,
    /// Nested by-model (under provider) or by-provider (under project/role) totals.
    pub nested: HashMap<String, Total>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Total {
    pub cost: f64,
    pub calls: u64,
    pub tokens: u64,
}

impl Total {
    fn add(&mut self, cost: f64, tokens: u64) {
        self.cost += cost;
        self.calls += 1;
        self.tokens += tokens;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CostsResult {
    pub total: Total,
    pub breakdown: Option<HashMap<String, Total>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total: Total,
    pub avg_cost_per_call: f64,
    pub avg_tokens_per_call: f64,
    pub top_providers: Vec<(String, Total)>,
    pub top_projects: Vec<(String, Total)>,
    pub top_roles: Vec<(String, Total)>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Export {
    pub records: Vec<CallRecord>,
    pub total: Total,
}

#[derive(Default)]
struct Ledger {
    records: Vec<CallRecord>,
    total: Total,
    by_provider: HashMap<String, Total>,
    by_provider_model: HashMap<String, HashMap<String, Total>>,
    by_project: HashMap<String, Total>,
    by_project_provider: HashMap<String, HashMap<String, Total>>,
    by_role: HashMap<String, Total>,
    by_role_provider: HashMap<String, HashMap<String, Total>>,
}

/// Process-resident cost ledger + roll-ups (spec §4.7).
pub struct CostTracker {
    inner: Mutex<Ledger>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Ledger::default()) }
    }

    /// Validates provider/model are non-empty and tokens/cost are non-negative
    /// before folding the record into the ledger (spec §4.7 "Validation on
    /// record").
    pub async fn record(&self, record: CallRecord) -> Result<(), String> {
        if record.provider.is_empty() || record.model.is_empty() {
            return Err("provider and model are required".to_string());
        }
        if record.cost < 0.0 {
            return Err("cost must be non-negative".to_string());
        }

        let total_tokens = record.tokens.total as u64;
        let mut ledger = self.inner.lock().await;

        ledger.total.add(record.cost, total_tokens);
        ledger.by_provider.entry(record.provider.clone()).or_default().add(record.cost, total_tokens);
        ledger
            .by_provider_model
            .entry(record.provider.clone())
            .or_default()
            .entry(record.model.clone())
            .or_default()
            .add(record.cost, total_tokens);

        if let Some(project) = &record.project_id {
            ledger.by_project.entry(project.clone()).or_default().add(record.cost, total_tokens);
            ledger
                .by_project_provider
                .entry(project.clone())
                .or_default()
                .entry(record.provider.clone())
                .or_default()
                .add(record.cost, total_tokens);
        }

        ledger.by_role.entry(record.role.clone()).or_default().add(record.cost, total_tokens);
        ledger
            .by_role_provider
            .entry(record.role.clone())
            .or_default()
            .entry(record.provider.clone())
            .or_default()
            .add(record.cost, total_tokens);

        ledger.records.push(record);
        Ok(())
    }

    /// `GetCosts(filters, groupBy)` — spec §4.7.
    pub async fn get_costs(&self, filters: &CostFilters, group_by: GroupBy) -> CostsResult {
        let ledger = self.inner.lock().await;

        let is_unfiltered = filters.provider.is_none()
            && filters.project.is_none()
            && filters.role.is_none()
            && filters.start_date.is_none()
            && filters.end_date.is_none();

        if is_unfiltered {
            let breakdown = match group_by {
                GroupBy::None => None,
                GroupBy::Provider => Some(ledger.by_provider.clone()),
                GroupBy::Project => Some(ledger.by_project.clone()),
                GroupBy::Role => Some(ledger.by_role.clone()),
            };
            return CostsResult { total: ledger.total.clone(), breakdown };
        }

        let mut total = Total::default();
        let mut breakdown: HashMap<String, Total> = HashMap::new();
        for record in ledger.records.iter().filter(|r| filters.matches(r)) {
            let tokens = record.tokens.total as u64;
            total.add(record.cost, tokens);
            let key = match group_by {
                GroupBy::None => None,
                GroupBy::Provider => Some(record.provider.clone()),
                GroupBy::Project => record.project_id.clone(),
                GroupBy::Role => Some(record.role.clone()),
            };
            if let Some(key) = key {
                breakdown.entry(key).or_default().add(record.cost, tokens);
            }
        }

        CostsResult { total, breakdown: (group_by != GroupBy::None).then_some(breakdown) }
    }

    /// `GetCallHistory(filters, limit, offset)` — paginated, newest first.
    pub async fn get_call_history(&self, filters: &CostFilters, limit: usize, offset: usize) -> Vec<CallRecord> {
        let ledger = self.inner.lock().await;
        let mut matched: Vec<&CallRecord> = ledger.records.iter().filter(|r| filters.matches(r)).collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matched.into_iter().skip(offset).take(limit).cloned().collect()
    }

    /// `GetSummary()` — totals, per-call averages, and top-N by cost per dimension.
    pub async fn get_summary(&self, top_n: usize) -> Summary {
        let ledger = self.inner.lock().await;
        let calls = ledger.total.calls.max(1) as f64;

        Summary {
            total: ledger.total.clone(),
            avg_cost_per_call: ledger.total.cost / calls,
            avg_tokens_per_call: ledger.total.tokens as f64 / calls,
            top_providers: top_n_by_cost(&ledger.by_provider, top_n),
            top_projects: top_n_by_cost(&ledger.by_project, top_n),
            top_roles: top_n_by_cost(&ledger.by_role, top_n),
        }
    }

    /// `Export(filters)` — a serializable snapshot of matching records.
    pub async fn export(&self, filters: &CostFilters) -> Export {
        let ledger = self.inner.lock().await;
        let records: Vec<CallRecord> = ledger.records.iter().filter(|r| filters.matches(r)).cloned().collect();
        let mut total = Total::default();
        for r in &records {
            total.add(r.cost, r.tokens.total as u64);
        }
        Export { records, total }
    }

    /// `Reset()` — clears the ledger and every roll-up.
    pub async fn reset(&self) {
        *self.inner.lock().await = Ledger::default();
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn top_n_by_cost(map: &HashMap<String, Total>, n: usize) -> Vec<(String, Total)> {
    let mut entries: Vec<(String, Total)> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    entries.sort_by(|a, b| b.1.cost.partial_cmp(&a.1.cost).unwrap_or(std::cmp::Ordering::Equal));
    entries.truncate(n);
    entries
}

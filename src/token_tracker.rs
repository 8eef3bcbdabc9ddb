//! Token tracker (spec §4.8).
//!
//! A lighter companion to [`crate::cost_tracker::CostTracker`]: same primary
//! keys (provider, model, role), but keyed on token counts instead of
//! dollars, plus a short rolling window so callers can ask "how many tokens
//! have we burned through in the last hour" without replaying the whole
//! ledger. [`crate::router::Router`] feeds both trackers from the same call
//! outcome (spec §4.8 "the router feeds both trackers with identical
//! events").

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::types::TokenUsage;

#[derive(Debug, Clone)]
struct TokenEvent {
    provider: String,
    model: String,
    role: String,
    tokens: TokenUsage,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub calls: u64,
}

impl TokenTotals {
    fn add(&mut self, tokens: TokenUsage) {
        self.input += tokens.input as u64;
        self.output += tokens.output as u64;
        self.total += tokens.total as u64;
        self.calls += 1;
    }
}

struct Window {
    events: VecDeque<TokenEvent>,
    horizon: ChronoDuration,
}

/// Process-resident token ledger with a rolling window (spec §4.8 "retaining
/// a short rolling window, e.g. last 60 minutes").
pub struct TokenTracker {
    window: Mutex<Window>,
    totals: Mutex<TokenTotalsState>,
}

#[derive(Default)]
struct TokenTotalsState {
    overall: TokenTotals,
    by_provider: HashMap<String, TokenTotals>,
    by_role: HashMap<String, TokenTotals>,
}

impl TokenTracker {
    pub fn new(window_minutes: i64) -> Self {
        Self {
            window: Mutex::new(Window {
                events: VecDeque::new(),
                horizon: ChronoDuration::minutes(window_minutes),
            }),
            totals: Mutex::new(TokenTotalsState::default()),
        }
    }

    /// Record one call's token usage, identical in shape to what
    /// [`crate::cost_tracker::CostTracker::record`] sees for the same call.
    pub async fn record(&self, provider: &str, model: &str, role: &str, tokens: TokenUsage) {
        let event = TokenEvent {
            provider: provider.to_string(),
            model: model.to_string(),
            role: role.to_string(),
            tokens,
            timestamp: Utc::now(),
        };

        {
            let mut totals = self.totals.lock().await;
            totals.overall.add(tokens);
            totals.by_provider.entry(provider.to_string()).or_default().add(tokens);
            totals.by_role.entry(role.to_string()).or_default().add(tokens);
        }

        let mut window = self.window.lock().await;
        let horizon = window.horizon;
        window.events.push_back(event);
        prune(&mut window.events, horizon);
    }

    /// Lifetime totals (no window applied) — overall plus by-provider/by-role.
    pub async fn totals(&self) -> (TokenTotals, HashMap<String, TokenTotals>, HashMap<String, TokenTotals>) {
        let totals = self.totals.lock().await;
        (totals.overall.clone(), totals.by_provider.clone(), totals.by_role.clone())
    }

    /// Totals within the configured rolling window, pruning stale events first.
    pub async fn window_totals(&self) -> TokenTotals {
        let mut window = self.window.lock().await;
        let horizon = window.horizon;
        prune(&mut window.events, horizon);

        let mut totals = TokenTotals::default();
        for event in &window.events {
            totals.add(event.tokens);
        }
        totals
    }
}

fn prune(events: &mut VecDeque<TokenEvent>, horizon: ChronoDuration) {
    let cutoff = Utc::now() - horizon;
    while matches!(events.front(), Some(e) if e.timestamp < cutoff) {
        events.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn totals_accumulate_across_calls() {
        let tracker = TokenTracker::new(60);
        tracker.record("openai", "gpt", "clarifier", TokenUsage::new(10, 5)).await;
        tracker.record("openai", "gpt", "clarifier", TokenUsage::new(20, 10)).await;

        let (overall, by_provider, _) = tracker.totals().await;
        assert_eq!(overall.input, 30);
        assert_eq!(overall.output, 15);
        assert_eq!(by_provider["openai"].total, 45);
    }

    #[tokio::test]
    async fn window_totals_match_totals_for_fresh_events() {
        let tracker = TokenTracker::new(60);
        tracker.record("p", "m", "r", TokenUsage::new(10, 5)).await;
        let window = tracker.window_totals().await;
        assert_eq!(window.total, 15);
        assert_eq!(window.calls, 1);
    }

    #[tokio::test]
    async fn window_excludes_events_older_than_the_horizon() {
        let tracker = TokenTracker::new(60);
        {
            let mut w = tracker.window.lock().await;
            w.events.push_back(TokenEvent {
                provider: "p".into(),
                model: "m".into(),
                role: "r".into(),
                tokens: TokenUsage::new(100, 100),
                timestamp: Utc::now() - ChronoDuration::minutes(120),
            });
        }
        let window = tracker.window_totals().await;
        assert_eq!(window.calls, 0);
    }

    #[tokio::test]
    async fn by_role_totals_are_keyed_independently_of_provider() {
        let tracker = TokenTracker::new(60);
        tracker.record("openai", "gpt", "clarifier", TokenUsage::new(10, 0)).await;
        tracker.record("anthropic", "claude", "clarifier", TokenUsage::new(20, 0)).await;

        let (_, _, by_role) = tracker.totals().await;
        assert_eq!(by_role["clarifier"].input, 30);
    }
}

//! Router core: the orchestrator tying every other module together (spec §4.11).
//!
//! [`Router`] owns one instance of each subsystem — config, registry, queue,
//! rate limiter, cache, templates, cost/token trackers, metrics, traffic log
//! — and drives the per-call algorithm across them. The shape follows the
//! teacher's `RouterState`/`route`/`dispatch`/`escalate` split: a shared state
//! struct, a top-level entry point, and a dispatch loop that walks a chain of
//! candidates. Where the teacher escalates across *tiers* based on response
//! quality, this walks a role's `[primary] ++ fallbacks` chain based on
//! failure classification instead.
//!
//! The queue is deliberately not a concurrency gate — [`RateLimiter`] already
//! enforces per-provider concurrency. Its only job is to establish dispatch
//! *order*: a single background task drains it strictly HIGH > NORMAL > LOW
//! and hands each waiter a one-shot "your turn" signal, exactly the pattern a
//! ticket counter uses to serialize a line without limiting how many tickets
//! exist. A single-permit `turn_gate` semaphore keeps the dispatcher from
//! handing out the *next* ticket until the current holder has actually
//! secured its rate-limiter slot — without it, tickets already in flight
//! toward a contended provider would form their own arrival-order queue at
//! the semaphore and silently undo the priority ordering just established.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{stream, Stream, StreamExt};
use serde_json::json;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::{validate_messages, ChatStream};
use crate::cache::ResponseCache;
use crate::config::{Config, ConfigStore, ModelPricing, RateLimitConfig};
use crate::cost_tracker::{CallRecord, CallStatus, CostTracker};
use crate::error::{ErrorKind, Result, RouterError};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::queue::PriorityQueue;
use crate::rate_limiter::RateLimiter;
use crate::registry::Registry;
use crate::templates::TemplateManager;
use crate::token_tracker::TokenTracker;
use crate::traffic::{TrafficEntry, TrafficLog};
use crate::types::{Candidate, CallOptions, ChatChunk, ChatMessage, ChatResponse};

/// Recent-activity ring buffer depth. Not one of the tracked subsystems
/// itself — an ambient observability aid — so it's a fixed constant rather
/// than a config knob.
const TRAFFIC_LOG_CAPACITY: usize = 1_000;

/// Poll interval for template hot reload — satisfies the ≥250ms debounce
/// requirement while reusing the teacher's mtime-poll idiom (`config_watcher`
/// in the pre-transform `main.rs`) rather than adding an inotify dependency.
const TEMPLATE_RELOAD_INTERVAL: Duration = Duration::from_millis(250);

/// Shared orchestrator. Always held behind `Arc` — `new` returns one already
/// wrapped, since the background queue dispatcher needs a handle to it.
pub struct Router {
    config: Arc<ConfigStore>,
    registry: Arc<Registry>,
    queue: PriorityQueue<oneshot::Sender<OwnedSemaphorePermit>>,
    turn_gate: Arc<Semaphore>,
    rate_limiter: RateLimiter,
    cache: ResponseCache,
    templates: Arc<TemplateManager>,
    cost_tracker: CostTracker,
    token_tracker: TokenTracker,
    metrics: MetricsCollector,
    traffic: TrafficLog,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    template_watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// When set, [`Router::wait_for_turn`] rejects new enqueues immediately
    /// rather than handing out tickets — the admin facade's pause/resume
    /// queue control (spec §6).
    queue_paused: AtomicBool,
}

impl Router {
    /// Build a router from a loaded config and a populated registry, and
    /// start its background queue dispatcher. Adapters must already be
    /// registered (see `main.rs`); rate limits and templates are read from
    /// the config snapshot at construction time.
    pub async fn new(config: Arc<ConfigStore>, registry: Arc<Registry>) -> anyhow::Result<Arc<Self>> {
        let snapshot = config.snapshot().await;

        let rate_limiter = RateLimiter::new();
        for (provider, rl) in &snapshot.rate_limits {
            rate_limiter.configure(provider, rl.clone());
        }
        for provider in snapshot.providers.keys() {
            if !snapshot.rate_limits.contains_key(provider) {
                rate_limiter.configure(provider, RateLimitConfig::default());
            }
        }

        let cache = ResponseCache::new(
            Duration::from_millis(snapshot.router.cache_ttl_ms),
            snapshot.router.cache_max_entries,
        );

        let templates = Arc::new(TemplateManager::new(snapshot.router.template_dir.clone()));
        templates.load_all().await?;

        let router = Arc::new(Self {
            config,
            registry,
            queue: PriorityQueue::new(snapshot.router.queue_max_size),
            turn_gate: Arc::new(Semaphore::new(1)),
            rate_limiter,
            cache,
            templates,
            cost_tracker: CostTracker::new(),
            token_tracker: TokenTracker::new(60),
            metrics: MetricsCollector::new(),
            traffic: TrafficLog::new(TRAFFIC_LOG_CAPACITY),
            dispatcher: std::sync::Mutex::new(None),
            template_watcher: std::sync::Mutex::new(None),
            queue_paused: AtomicBool::new(false),
        });

        let handle = tokio::spawn(run_queue_dispatcher(router.clone()));
        *router.dispatcher.lock().expect("dispatcher mutex poisoned") = Some(handle);

        let templates = router.templates.clone();
        let watcher = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TEMPLATE_RELOAD_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let reloaded = templates.reload_changed().await;
                if !reloaded.is_empty() {
                    tracing::info!(templates = ?reloaded, "templates hot-reloaded");
                }
            }
        });
        *router.template_watcher.lock().expect("template watcher mutex poisoned") = Some(watcher);

        Ok(router)
    }

    pub fn templates(&self) -> &TemplateManager {
        &self.templates
    }

    pub fn cost_tracker(&self) -> &CostTracker {
        &self.cost_tracker
    }

    pub fn token_tracker(&self) -> &TokenTracker {
        &self.token_tracker
    }

    pub fn traffic(&self) -> &TrafficLog {
        &self.traffic
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    pub async fn queue_metrics(&self) -> crate::queue::QueueMetrics {
        self.queue.metrics().await
    }

    pub fn cache_stats(&self) -> crate::cache::CacheStatsSnapshot {
        self.cache.stats()
    }

    /// `GetMetrics()` — spec §6.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// `UpdatePricing(provider, model, pricing)` — spec §6.
    pub async fn update_pricing(&self, provider: &str, model: &str, pricing: ModelPricing) {
        self.config.update_pricing(provider, model, pricing).await;
    }

    /// `SetFeatureFlag(name, value)` — spec §6.
    pub async fn set_feature_flag(&self, name: &str, value: bool) {
        self.config.set_feature_flag(name, value).await;
    }

    /// `RegisterProvider(adapter)` — spec §6. Also installs default rate
    /// limits for the provider if none are configured yet.
    pub fn register_provider(&self, adapter: Arc<dyn crate::adapters::Adapter>) {
        let name = adapter.name().to_string();
        self.registry.register(adapter);
        self.rate_limiter.configure(&name, RateLimitConfig::default());
    }

    /// `Shutdown()` — spec §6. Stops the background queue dispatcher and
    /// template watcher; the queue and its waiters are dropped with the router.
    pub fn shutdown(&self) {
        if let Some(handle) = self.dispatcher.lock().expect("dispatcher mutex poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self.template_watcher.lock().expect("template watcher mutex poisoned").take() {
            handle.abort();
        }
    }

    /// Pause the dispatch queue — spec §6 "pause/resume a queue". New calls
    /// fail fast with `QUEUE_FULL` instead of waiting for a turn; in-flight
    /// dispatches are unaffected.
    pub fn pause_queue(&self) {
        self.queue_paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_queue(&self) {
        self.queue_paused.store(false, Ordering::SeqCst);
    }

    pub fn queue_paused(&self) -> bool {
        self.queue_paused.load(Ordering::SeqCst)
    }

    /// Drop every ticket currently waiting in the queue — spec §6 "clean a
    /// queue". Waiters observe their turn-signal channel close and surface
    /// `INTERNAL`; already-dispatched calls are unaffected.
    pub async fn clean_queue(&self) {
        self.queue.clear().await;
    }

    /// `CallByRole(role, messages, options)` — an alias for [`Router::call`].
    /// The role is already `call`'s primary argument; this exists purely to
    /// mirror the library surface named in spec §6.
    pub async fn call_by_role(
        self: &Arc<Self>,
        role: &str,
        messages: Vec<ChatMessage>,
        options: CallOptions,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse> {
        self.call(role, messages, options, cancellation).await
    }

    /// `Call(role, messages, options)` — the non-streaming dispatch
    /// algorithm (spec §4.11 steps 1-8). `cancellation` is checked or
    /// selected against at every suspension point (queue wait, rate-limiter
    /// acquire, transport call) per spec §5; pass
    /// `CancellationToken::new()` for a call that never cancels.
    pub async fn call(
        self: &Arc<Self>,
        role: &str,
        messages: Vec<ChatMessage>,
        options: CallOptions,
        cancellation: CancellationToken,
    ) -> Result<ChatResponse> {
        // Step 1: validate.
        validate_messages(&messages)?;
        if cancellation.is_cancelled() {
            return Err(RouterError::cancelled());
        }

        let config = self.config.snapshot().await;

        // Step 2: resolve role to a dispatch chain.
        let mapping = config.role(role).ok_or_else(|| RouterError::config(format!("unknown role `{role}`")))?;
        let candidates = mapping.candidates();
        let primary = candidates[0].clone();

        // Template rendering happens before the cache key is computed (see
        // `CallOptions::salient`'s doc comment): the rendered content is
        // what actually needs to be identical for two calls to coalesce.
        let messages = self.render_template(&messages, &options).await?;
        let salient = options.salient();
        let cache_key = ResponseCache::key(&primary.model, &messages, &salient);

        // Step 3: cache lookup, with request coalescing so at most one
        // upstream call is ever in flight per key.
        let coalesce_guard = if options.use_cache { Some(self.cache.coalesce(&cache_key).await) } else { None };

        if options.use_cache {
            if let Some(mut cached) = self.cache.get(&cache_key) {
                self.metrics.record_cache_hit(&primary.provider, role);
                cached.cached = true;
                self.traffic.push(
                    TrafficEntry::new(role.to_string(), cached.provider.clone(), cached.model.clone(), 0, true)
                        .mark_cached(),
                );
                return Ok(cached);
            }
            self.metrics.record_cache_miss(&primary.provider, role);
        }

        // Step 5: queue for a dispatch turn.
        let (queue_wait_ms, turn_permit, ticket_id) =
            self.wait_for_turn(&config, options.priority, &cancellation).await?;

        // Step 6: dispatch across the fallback chain, with per-candidate retry.
        let dispatch = self
            .dispatch_with_fallback(&config, role, &candidates, &messages, &options, turn_permit, &cancellation)
            .await;

        let (mut response, used_candidate, fallback_activated) = match dispatch {
            Ok(outcome) => {
                self.queue.mark_completed(ticket_id);
                outcome
            }
            Err(final_err) => {
                self.queue.mark_failed(ticket_id);
                if final_err.kind == ErrorKind::Cancelled {
                    self.metrics.record_cancelled(&final_err.provider.clone().unwrap_or_default(), role);
                }
                self.traffic.push(
                    TrafficEntry::new(
                        role.to_string(),
                        final_err.provider.clone().unwrap_or_default(),
                        final_err.model.clone().unwrap_or_default(),
                        0,
                        false,
                    )
                    .with_error(&final_err.kind.to_string()),
                );
                self.cost_tracker
                    .record(CallRecord {
                        provider: final_err.provider.clone().unwrap_or_default(),
                        model: final_err.model.clone().unwrap_or_default(),
                        role: role.to_string(),
                        project_id: options.project_id.clone(),
                        tokens: crate::types::TokenUsage::new(0, 0),
                        cost: 0.0,
                        latency_ms: 0,
                        status: CallStatus::Error,
                        timestamp: chrono::Utc::now(),
                    })
                    .await
                    .ok();
                drop(coalesce_guard);
                let mut err = final_err;
                if let Some(id) = &options.correlation_id {
                    err = err.with_correlation_id(id.clone());
                }
                return Err(err);
            }
        };

        self.metrics.record_queue_wait(&used_candidate.provider, role, queue_wait_ms);

        // Step 7: compute cost if the adapter didn't already fill it in.
        if response.cost == 0.0 {
            if let Ok(adapter) = self.registry.get(&used_candidate.provider) {
                let pricing = config.cost_per_million(&used_candidate.provider, &used_candidate.model);
                response.cost = adapter.calculate_cost(response.tokens, pricing);
            }
        }

        self.cost_tracker
            .record(CallRecord {
                provider: used_candidate.provider.clone(),
                model: used_candidate.model.clone(),
                role: role.to_string(),
                project_id: options.project_id.clone(),
                tokens: response.tokens,
                cost: response.cost,
                latency_ms: response.latency_ms,
                status: CallStatus::Success,
                timestamp: chrono::Utc::now(),
            })
            .await
            .ok();
        self.token_tracker.record(&used_candidate.provider, &used_candidate.model, role, response.tokens).await;

        // Step 8: store in cache and return.
        if options.use_cache {
            self.cache.insert(cache_key, response.clone());
        }
        drop(coalesce_guard);

        let mut entry = TrafficEntry::new(
            role.to_string(),
            used_candidate.provider.clone(),
            used_candidate.model.clone(),
            response.latency_ms,
            true,
        )
        .with_cost(response.cost);
        if fallback_activated {
            entry = entry.mark_fallback_activated();
        }
        self.traffic.push(entry);

        Ok(response)
    }

    /// `Stream(role, messages, options)` — the streaming variant (spec
    /// §4.11 streaming state machine). Never cached. Fallback is only
    /// attempted while establishing the stream; once chunks start arriving,
    /// a mid-stream error surfaces to the caller as-is rather than
    /// triggering a fallback.
    pub async fn stream(
        self: &Arc<Self>,
        role: &str,
        messages: Vec<ChatMessage>,
        options: CallOptions,
        cancellation: CancellationToken,
    ) -> Result<std::pin::Pin<Box<dyn Stream<Item = Result<ChatChunk>> + Send>>> {
        validate_messages(&messages)?;
        if cancellation.is_cancelled() {
            return Err(RouterError::cancelled());
        }
        let config = self.config.snapshot().await;

        let mapping = config.role(role).ok_or_else(|| RouterError::config(format!("unknown role `{role}`")))?;
        let candidates = mapping.candidates();

        let messages = self.render_template(&messages, &options).await?;

        let (_queue_wait_ms, turn_permit, ticket_id) =
            self.wait_for_turn(&config, options.priority, &cancellation).await?;

        let open = self
            .open_stream_with_fallback(&config, role, &candidates, &messages, &options, turn_permit, &cancellation)
            .await;
        let (inner, used_candidate) = match open {
            Ok(opened) => opened,
            Err(err) => {
                self.queue.mark_failed(ticket_id);
                return Err(err);
            }
        };

        let pricing = config.cost_per_million(&used_candidate.provider, &used_candidate.model);
        let adapter = self.registry.get(&used_candidate.provider).ok();
        let input_tokens = messages.iter().map(|m| crate::adapters::estimate_tokens(&m.content)).sum();

        let state = StreamState {
            inner,
            role: role.to_string(),
            provider: used_candidate.provider,
            model: used_candidate.model,
            correlation_id: options.correlation_id.clone(),
            pricing,
            adapter,
            router: self.clone(),
            ticket_id,
            chunk_index: 0,
            input_tokens,
            output_content: String::new(),
            started: Instant::now(),
            finished: false,
        };

        Ok(Box::pin(stream::unfold(state, stream_step)))
    }

    async fn render_template(&self, messages: &[ChatMessage], options: &CallOptions) -> Result<Vec<ChatMessage>> {
        let Some(name) = &options.template_name else { return Ok(messages.to_vec()) };
        let rendered = self.templates.render(name, &options.template_variables).await?;

        let mut messages = messages.to_vec();
        if let Some(last_user) = messages.iter_mut().rev().find(|m| m.role == crate::types::MessageRole::User) {
            last_user.content = rendered;
        } else {
            messages.push(ChatMessage::user(rendered));
        }
        Ok(messages)
    }

    /// `RequestStatus(id)` (spec §4.4) for a ticket previously returned by
    /// `wait_for_turn`'s enqueue.
    pub async fn request_status(&self, id: uuid::Uuid) -> Option<crate::queue::RequestStatusView> {
        self.queue.request_status(id).await
    }

    /// Enqueue a ticket at `priority` and wait for the dispatcher to signal
    /// our turn, honoring `queue_wait_timeout_ms` and an optional caller
    /// cancellation signal. Returns the observed wait, the turn-gate permit
    /// — the caller must drop it as soon as it has secured its own
    /// rate-limiter slot, so the next ticket can be released — and the
    /// ticket id, so the caller can record the dispatch's terminal status.
    async fn wait_for_turn(
        &self,
        config: &Config,
        priority: crate::types::Priority,
        cancellation: &tokio_util::sync::CancellationToken,
    ) -> Result<(u64, OwnedSemaphorePermit, uuid::Uuid)> {
        if self.queue_paused.load(Ordering::SeqCst) {
            return Err(RouterError::new(ErrorKind::QueueFull, "dispatch queue is paused"));
        }

        let enqueued_at = Instant::now();
        let (tx, rx) = oneshot::channel();
        let ticket_id = self.queue.enqueue(priority, tx).await?;

        let timeout = Duration::from_millis(config.router.queue_wait_timeout_ms);
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                self.queue.remove(ticket_id).await;
                Err(RouterError::cancelled())
            }
            result = tokio::time::timeout(timeout, rx) => match result {
                Ok(Ok(permit)) => Ok((enqueued_at.elapsed().as_millis() as u64, permit, ticket_id)),
                Ok(Err(_)) => {
                    self.queue.mark_failed(ticket_id);
                    Err(RouterError::new(ErrorKind::Internal, "queue dispatcher dropped ticket"))
                }
                Err(_) => {
                    self.queue.remove(ticket_id).await;
                    Err(RouterError::new(ErrorKind::TimeoutQueue, "timed out waiting in queue"))
                }
            },
        }
    }

    /// Walk `[primary] ++ fallbacks`, retrying retryable errors within a
    /// candidate up to `max_retries` times with exponential backoff before
    /// advancing to the next candidate (spec §4.11 step 6, §7 retry/fallback
    /// table).
    async fn dispatch_with_fallback(
        &self,
        config: &Config,
        role: &str,
        candidates: &[Candidate],
        messages: &[ChatMessage],
        options: &CallOptions,
        turn_permit: OwnedSemaphorePermit,
        cancellation: &CancellationToken,
    ) -> std::result::Result<(ChatResponse, Candidate, bool), RouterError> {
        let max_retries = config.router.max_retries;
        let base_delay = Duration::from_millis(config.router.retry_delay_ms);
        let mut previous_attempts = Vec::new();
        let mut fallback_activated = false;
        let mut turn_permit = Some(turn_permit);

        for (idx, candidate) in candidates.iter().enumerate() {
            if idx > 0 {
                fallback_activated = true;
                self.metrics.record_fallback(&candidate.provider, role);
            }

            let adapter = match self.registry.get(&candidate.provider) {
                Ok(adapter) => adapter,
                Err(err) => {
                    previous_attempts.push(err);
                    continue;
                }
            };

            let mut candidate_err: Option<RouterError> = None;
            for attempt in 0..=max_retries {
                if cancellation.is_cancelled() {
                    return Err(RouterError::cancelled());
                }
                let permit = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(RouterError::cancelled()),
                    permit = self.rate_limiter.acquire(&candidate.provider) => permit?,
                };
                // The turn gate only needs to hold back later-priority tickets
                // until this call has secured its place in line for the
                // provider; once that's done the actual dispatch (including
                // retries) can run concurrently with other in-flight turns.
                turn_permit.take();
                let started = Instant::now();
                let outcome = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        drop(permit);
                        return Err(RouterError::cancelled().with_provider(&candidate.provider).with_model(&candidate.model));
                    }
                    outcome = adapter.chat(&candidate.model, messages, options) => outcome,
                };
                drop(permit);
                let dispatch_latency_ms = started.elapsed().as_millis() as u64;

                match outcome {
                    Ok(response) => {
                        self.metrics.record_success(&candidate.provider, role, dispatch_latency_ms);
                        return Ok((response, candidate.clone(), fallback_activated));
                    }
                    Err(err) => {
                        self.metrics.record_failure(&candidate.provider, role, dispatch_latency_ms);
                        let err = err.with_provider(&candidate.provider).with_model(&candidate.model);
                        let retryable = adapter.is_retryable_error(&err);
                        candidate_err = Some(err);
                        if retryable && attempt < max_retries {
                            self.metrics.record_retry(&candidate.provider, role);
                            tokio::time::sleep(base_delay * 2u32.pow(attempt)).await;
                            continue;
                        }
                        break;
                    }
                }
            }

            let Some(err) = candidate_err else { continue };
            let allows_fallback = err.kind.allows_fallback();
            previous_attempts.push(err.clone());
            if !allows_fallback {
                return Err(err.with_previous_attempts(previous_attempts[..previous_attempts.len() - 1].to_vec()));
            }
        }

        let last = previous_attempts
            .pop()
            .unwrap_or_else(|| RouterError::new(ErrorKind::Internal, "no candidates configured for role"));
        Err(last.with_previous_attempts(previous_attempts))
    }

    /// Establish a stream from the fallback chain — identical retry/fallback
    /// mechanics to [`Router::dispatch_with_fallback`], but opening a stream
    /// instead of a buffered call.
    async fn open_stream_with_fallback(
        &self,
        config: &Config,
        role: &str,
        candidates: &[Candidate],
        messages: &[ChatMessage],
        options: &CallOptions,
        turn_permit: OwnedSemaphorePermit,
        cancellation: &CancellationToken,
    ) -> Result<(ChatStream, Candidate)> {
        let max_retries = config.router.max_retries;
        let base_delay = Duration::from_millis(config.router.retry_delay_ms);
        let mut previous_attempts = Vec::new();
        let mut turn_permit = Some(turn_permit);

        for (idx, candidate) in candidates.iter().enumerate() {
            if idx > 0 {
                self.metrics.record_fallback(&candidate.provider, role);
            }

            let adapter = match self.registry.get(&candidate.provider) {
                Ok(adapter) => adapter,
                Err(err) => {
                    previous_attempts.push(err);
                    continue;
                }
            };

            let mut candidate_err: Option<RouterError> = None;
            for attempt in 0..=max_retries {
                if cancellation.is_cancelled() {
                    return Err(RouterError::cancelled());
                }
                let permit = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => return Err(RouterError::cancelled()),
                    permit = self.rate_limiter.acquire(&candidate.provider) => permit?,
                };
                turn_permit.take();
                let outcome = tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        drop(permit);
                        return Err(RouterError::cancelled().with_provider(&candidate.provider).with_model(&candidate.model));
                    }
                    outcome = adapter.chat_stream(&candidate.model, messages, options) => outcome,
                };
                drop(permit);

                match outcome {
                    Ok(stream) => return Ok((stream, candidate.clone())),
                    Err(err) => {
                        let err = err.with_provider(&candidate.provider).with_model(&candidate.model);
                        let retryable = adapter.is_retryable_error(&err);
                        candidate_err = Some(err);
                        if retryable && attempt < max_retries {
                            tokio::time::sleep(base_delay * 2u32.pow(attempt)).await;
                            continue;
                        }
                        break;
                    }
                }
            }

            let Some(err) = candidate_err else { continue };
            let allows_fallback = err.kind.allows_fallback();
            previous_attempts.push(err.clone());
            if !allows_fallback {
                return Err(err.with_previous_attempts(previous_attempts[..previous_attempts.len() - 1].to_vec()));
            }
        }

        let last = previous_attempts
            .pop()
            .unwrap_or_else(|| RouterError::new(ErrorKind::Internal, "no candidates configured for role"));
        Err(last.with_previous_attempts(previous_attempts))
    }
}

async fn run_queue_dispatcher(router: Arc<Router>) {
    loop {
        // Hold the gate closed until *some* ticket is ready to take it: this
        // is what stops the dispatcher from handing out ticket N+1 while
        // ticket N is still contending for its rate-limiter slot.
        let Ok(permit) = router.turn_gate.clone().acquire_owned().await else { return };
        match router.queue.dequeue(Duration::from_secs(3600)).await {
            Ok(entry) => {
                let _ = entry.payload.send(permit);
            }
            Err(_) => drop(permit),
        }
    }
}

struct StreamState {
    inner: ChatStream,
    role: String,
    provider: String,
    model: String,
    correlation_id: Option<String>,
    pricing: Option<ModelPricing>,
    adapter: Option<Arc<dyn crate::adapters::Adapter>>,
    router: Arc<Router>,
    ticket_id: uuid::Uuid,
    chunk_index: u32,
    input_tokens: u32,
    output_content: String,
    started: Instant,
    finished: bool,
}

async fn stream_step(mut state: StreamState) -> Option<(Result<ChatChunk>, StreamState)> {
    if state.finished {
        return None;
    }

    match state.inner.next().await {
        Some(Ok(mut chunk)) => {
            chunk.role = state.role.clone();
            chunk.chunk_index = state.chunk_index;
            chunk.done = false;
            state.chunk_index += 1;
            state.output_content.push_str(&chunk.content);
            Some((Ok(chunk), state))
        }
        Some(Err(err)) => {
            state.finished = true;
            state.router.queue.mark_failed(state.ticket_id);
            let elapsed = state.started.elapsed().as_millis() as u64;
            state.router.metrics.record_failure(&state.provider, &state.role, elapsed);
            let output_tokens = crate::adapters::estimate_tokens(&state.output_content);
            let tokens = crate::types::TokenUsage::new(state.input_tokens, output_tokens);
            state
                .router
                .cost_tracker
                .record(CallRecord {
                    provider: state.provider.clone(),
                    model: state.model.clone(),
                    role: state.role.clone(),
                    project_id: None,
                    tokens,
                    cost: 0.0,
                    latency_ms: elapsed,
                    status: CallStatus::Error,
                    timestamp: chrono::Utc::now(),
                })
                .await
                .ok();
            Some((Err(err.with_provider(&state.provider).with_model(&state.model)), state))
        }
        None => {
            state.finished = true;
            state.router.queue.mark_completed(state.ticket_id);
            let output_tokens = crate::adapters::estimate_tokens(&state.output_content);
            let tokens = crate::types::TokenUsage::new(state.input_tokens, output_tokens);
            let cost = state.adapter.as_ref().map(|a| a.calculate_cost(tokens, state.pricing)).unwrap_or(0.0);
            let latency_ms = state.started.elapsed().as_millis() as u64;

            state.router.metrics.record_success(&state.provider, &state.role, latency_ms);
            state
                .router
                .cost_tracker
                .record(CallRecord {
                    provider: state.provider.clone(),
                    model: state.model.clone(),
                    role: state.role.clone(),
                    project_id: None,
                    tokens,
                    cost,
                    latency_ms,
                    status: CallStatus::Success,
                    timestamp: chrono::Utc::now(),
                })
                .await
                .ok();
            state.router.token_tracker.record(&state.provider, &state.model, &state.role, tokens).await;
            state.router.traffic.push(
                TrafficEntry::new(state.role.clone(), state.provider.clone(), state.model.clone(), latency_ms, true)
                    .with_cost(cost),
            );

            let metadata = json!({
                "tokens": tokens,
                "cost": cost,
                "latencyMs": latency_ms,
                "chunkCount": state.chunk_index,
                "correlationId": state.correlation_id,
            })
            .as_object()
            .cloned()
            .unwrap_or_default();

            let final_chunk = ChatChunk {
                provider: state.provider.clone(),
                model: state.model.clone(),
                role: state.role.clone(),
                chunk_index: state.chunk_index,
                content: String::new(),
                done: true,
                metadata,
            };
            Some((Ok(final_chunk), state))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::config::{ProviderConfig, ProviderKind, RoleMapping};
    use crate::error::ErrorKind;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn base_config() -> Config {
        let mut role_mappings = HashMap::new();
        role_mappings.insert(
            "clarifier".to_string(),
            RoleMapping { primary: Candidate::new("p1", "m1"), fallbacks: vec![Candidate::new("p2", "m2")] },
        );
        let mut providers = HashMap::new();
        providers.insert(
            "p1".to_string(),
            ProviderConfig { kind: ProviderKind::Mock, base_url: String::new(), api_key_env: None, timeout_ms: 5_000, enabled: true },
        );
        providers.insert(
            "p2".to_string(),
            ProviderConfig { kind: ProviderKind::Mock, base_url: String::new(), api_key_env: None, timeout_ms: 5_000, enabled: true },
        );

        Config {
            router: crate::config::RouterSettings {
                max_retries: 1,
                retry_delay_ms: 1,
                queue_wait_timeout_ms: 5_000,
                ..Default::default()
            },
            providers,
            rate_limits: HashMap::new(),
            pricing: HashMap::new(),
            role_mappings,
            feature_flags: HashMap::new(),
        }
    }

    async fn make_router(p1: MockAdapter, p2: MockAdapter) -> Arc<Router> {
        let config = Arc::new(ConfigStore::new(base_config()));
        let registry = Arc::new(Registry::new());
        registry.register(Arc::new(p1));
        registry.register(Arc::new(p2));
        Router::new(config, registry).await.unwrap()
    }

    #[tokio::test]
    async fn call_returns_response_from_primary_on_success() {
        let router = make_router(MockAdapter::new("p1"), MockAdapter::new("p2")).await;
        let messages = vec![ChatMessage::user("hello")];
        let response = router.call("clarifier", messages, CallOptions::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.provider, "p1");
        assert_eq!(response.content, "echo: hello");
    }

    #[tokio::test]
    async fn second_identical_call_is_served_from_cache() {
        let router = make_router(MockAdapter::new("p1"), MockAdapter::new("p2")).await;
        let messages = vec![ChatMessage::user("hello")];
        let first = router.call("clarifier", messages.clone(), CallOptions::default(), CancellationToken::new()).await.unwrap();
        assert!(!first.cached);

        let second = router.call("clarifier", messages, CallOptions::default(), CancellationToken::new()).await.unwrap();
        assert!(second.cached);
        assert_eq!(router.get_metrics().buckets.iter().map(|b| b.cache_hits).sum::<u64>(), 1);
    }

    // Scenario: primary fails with a retryable, fallback-eligible error on
    // every attempt; the router exhausts `max_retries` against it, then
    // falls back to the secondary, which succeeds.
    #[tokio::test]
    async fn falls_back_to_secondary_after_primary_exhausts_retries() {
        let p1 = MockAdapter::new("p1").failing(ErrorKind::ServerError);
        let p2 = MockAdapter::new("p2");
        let router = make_router(p1, p2).await;

        let messages = vec![ChatMessage::user("hello")];
        let response = router
            .call("clarifier", messages, CallOptions { use_cache: false, ..Default::default() }, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.provider, "p2");
        let snap = router.get_metrics();
        let p1_bucket = snap.buckets.iter().find(|b| b.provider == "p1").unwrap();
        assert_eq!(p1_bucket.retries_total, 1);
        let p2_bucket = snap.buckets.iter().find(|b| b.provider == "p2").unwrap();
        assert_eq!(p2_bucket.calls_success, 1);
        let total_fallbacks: u64 = snap.buckets.iter().map(|b| b.fallback_activations).sum();
        assert_eq!(total_fallbacks, 1);
    }

    #[tokio::test]
    async fn non_fallback_eligible_error_fails_without_trying_secondary() {
        let p1 = MockAdapter::new("p1").failing(ErrorKind::Validation);
        let p2 = MockAdapter::new("p2");
        let router = make_router(p1, p2).await;

        let messages = vec![ChatMessage::user("hello")];
        let err = router
            .call("clarifier", messages, CallOptions { use_cache: false, ..Default::default() }, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Validation);
        let snap = router.get_metrics();
        assert!(snap.buckets.iter().all(|b| b.provider != "p2"));
    }

    #[tokio::test]
    async fn unknown_role_returns_config_error() {
        let router = make_router(MockAdapter::new("p1"), MockAdapter::new("p2")).await;
        let err =
            router.call("ghost-role", vec![ChatMessage::user("hi")], CallOptions::default(), CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[tokio::test]
    async fn streaming_call_yields_a_final_done_chunk_with_metadata() {
        let router = make_router(MockAdapter::new("p1"), MockAdapter::new("p2")).await;
        let messages = vec![ChatMessage::user("a b c")];
        let mut stream = router.stream("clarifier", messages, CallOptions::default(), CancellationToken::new()).await.unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }

        let last = chunks.last().unwrap();
        assert!(last.done);
        assert!(last.metadata.contains_key("cost"));
        assert!(last.metadata.contains_key("chunkCount"));
        assert!(chunks[..chunks.len() - 1].iter().all(|c| !c.done));
    }

    // Priority ordering at the queue level is already covered by
    // `queue::tests::dequeue_drains_high_before_normal_before_low`. Here we
    // only need the router-level integration: once a ticket holder is stuck
    // waiting on a busy rate limiter it holds the turn gate closed, and a
    // third caller stuck behind *that* for longer than
    // `queue_wait_timeout_ms` surfaces `TimeoutQueue` rather than hanging.
    #[tokio::test]
    async fn call_times_out_waiting_in_queue_when_the_turn_gate_stays_closed() {
        let mut cfg = base_config();
        cfg.rate_limits.insert("p1".into(), RateLimitConfig { max_concurrent: 1, ..Default::default() });
        cfg.router.queue_wait_timeout_ms = 20;
        let config = Arc::new(ConfigStore::new(cfg));
        let registry = Arc::new(Registry::new());
        registry.register(Arc::new(MockAdapter::new("p1").with_latency(StdDuration::from_millis(200))));
        registry.register(Arc::new(MockAdapter::new("p2")));
        let router = Router::new(config, registry).await.unwrap();

        // Occupy the sole p1 permit for far longer than the queue timeout.
        let blocker_router = router.clone();
        let blocker = tokio::spawn(async move {
            blocker_router
                .call("clarifier", vec![ChatMessage::user("blocker")], CallOptions { use_cache: false, ..Default::default() }, CancellationToken::new())
                .await
                .unwrap();
        });
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        // Gets its turn immediately (gate is free) but then blocks on the
        // rate limiter behind `blocker`, holding the turn gate closed.
        let second_router = router.clone();
        let second = tokio::spawn(async move {
            second_router
                .call("clarifier", vec![ChatMessage::user("second")], CallOptions { use_cache: false, ..Default::default() }, CancellationToken::new())
                .await
                .unwrap();
        });
        tokio::time::sleep(StdDuration::from_millis(5)).await;

        // Stuck waiting for the turn gate itself, which `second` won't
        // release until its own rate-limiter acquire resolves (~190ms away).
        let err = router
            .call("clarifier", vec![ChatMessage::user("third")], CallOptions { use_cache: false, ..Default::default() }, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimeoutQueue);

        blocker.await.unwrap();
        second.await.unwrap();
    }

    #[tokio::test]
    async fn cancelling_mid_dispatch_surfaces_cancelled_and_does_not_hang() {
        let p1 = MockAdapter::new("p1").with_latency(StdDuration::from_millis(200));
        let router = make_router(p1, MockAdapter::new("p2")).await;

        let token = CancellationToken::new();
        let call_token = token.clone();
        let call_router = router.clone();
        let handle = tokio::spawn(async move {
            call_router
                .call(
                    "clarifier",
                    vec![ChatMessage::user("hello")],
                    CallOptions { use_cache: false, ..Default::default() },
                    call_token,
                )
                .await
        });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn call_with_already_cancelled_token_fails_fast() {
        let router = make_router(MockAdapter::new("p1"), MockAdapter::new("p2")).await;
        let token = CancellationToken::new();
        token.cancel();

        let err = router
            .call("clarifier", vec![ChatMessage::user("hi")], CallOptions::default(), token)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}

//! Bounded three-level priority queue (spec §4.4).
//!
//! No existing dependency in the teacher's stack models this shape, so it's
//! hand-rolled in the teacher's own idiom: bounded `VecDeque`s with explicit
//! drop-on-full behavior, the same style as `TrafficLog`'s ring buffer. Three
//! independent `tokio::sync::Mutex<VecDeque<QueueEntry>>` (HIGH/NORMAL/LOW)
//! share one `tokio::sync::Notify` for wakeups; `dequeue` always drains HIGH
//! before NORMAL before LOW.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{ErrorKind, Result, RouterError};
use crate::types::Priority;

/// Lifecycle state of one queued request, for `RequestStatus(id)` (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// `RequestStatus(id)` result: state plus position/estimated wait while queued.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RequestStatusView {
    pub state: RequestState,
    pub position: Option<usize>,
    pub estimated_wait_ms: Option<f64>,
}

/// One request waiting for a rate-limiter slot / dispatch turn.
pub struct QueueEntry<T> {
    pub id: Uuid,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub payload: T,
}

struct Lane<T> {
    entries: Mutex<VecDeque<QueueEntry<T>>>,
}

impl<T> Lane<T> {
    fn new() -> Self {
        Self { entries: Mutex::new(VecDeque::new()) }
    }
}

/// Rolling sample of recent wait times, used for [`QueueMetrics::avg_wait_ms`].
struct WaitSamples {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl WaitSamples {
    fn new(capacity: usize) -> Self {
        Self { samples: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ms);
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueMetrics {
    pub depth: usize,
    pub high_depth: usize,
    pub normal_depth: usize,
    pub low_depth: usize,
    pub avg_wait_ms: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dropped: u64,
}

/// A bounded, three-priority FIFO queue with wait-time tracking.
pub struct PriorityQueue<T> {
    high: Lane<T>,
    normal: Lane<T>,
    low: Lane<T>,
    max_size: usize,
    notify: Notify,
    wait_samples: Mutex<WaitSamples>,
    statuses: DashMap<Uuid, RequestState>,
    total_enqueued: AtomicU64,
    total_dequeued: AtomicU64,
    total_dropped: AtomicU64,
}

const WAIT_SAMPLE_WINDOW: usize = 1_000;

impl<T> PriorityQueue<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            high: Lane::new(),
            normal: Lane::new(),
            low: Lane::new(),
            max_size,
            notify: Notify::new(),
            wait_samples: Mutex::new(WaitSamples::new(WAIT_SAMPLE_WINDOW)),
            statuses: DashMap::new(),
            total_enqueued: AtomicU64::new(0),
            total_dequeued: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    fn lane(&self, priority: Priority) -> &Lane<T> {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    async fn total_depth(&self) -> usize {
        self.high.entries.lock().await.len()
            + self.normal.entries.lock().await.len()
            + self.low.entries.lock().await.len()
    }

    /// Enqueue a payload. Returns `QUEUE_FULL` if the combined depth across
    /// all three lanes is already at `max_size`.
    pub async fn enqueue(&self, priority: Priority, payload: T) -> Result<Uuid> {
        if self.total_depth().await >= self.max_size {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
            return Err(RouterError::new(ErrorKind::QueueFull, "request queue is at capacity"));
        }
        let id = Uuid::new_v4();
        let entry = QueueEntry { id, priority, enqueued_at: Instant::now(), payload };
        self.lane(priority).entries.lock().await.push_back(entry);
        self.statuses.insert(id, RequestState::Queued);
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(id)
    }

    /// Dequeue the oldest HIGH entry, or NORMAL, or LOW, waiting up to
    /// `timeout` for something to arrive. Returns `TIMEOUT_QUEUE` if nothing
    /// arrives in time.
    pub async fn dequeue(&self, timeout: Duration) -> Result<QueueEntry<T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(entry) = self.try_dequeue().await {
                let wait_ms = entry.enqueued_at.elapsed().as_millis() as u64;
                self.wait_samples.lock().await.push(wait_ms);
                self.statuses.insert(entry.id, RequestState::Processing);
                self.total_dequeued.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RouterError::new(ErrorKind::TimeoutQueue, "timed out waiting in queue"));
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn try_dequeue(&self) -> Option<QueueEntry<T>> {
        if let Some(entry) = self.high.entries.lock().await.pop_front() {
            return Some(entry);
        }
        if let Some(entry) = self.normal.entries.lock().await.pop_front() {
            return Some(entry);
        }
        self.low.entries.lock().await.pop_front()
    }

    /// Remove a previously enqueued entry by id, e.g. on caller cancellation.
    pub async fn remove(&self, id: Uuid) -> bool {
        for lane in [&self.high, &self.normal, &self.low] {
            let mut entries = lane.entries.lock().await;
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                self.statuses.insert(id, RequestState::Failed);
                return true;
            }
        }
        false
    }

    pub async fn clear(&self) {
        for lane in [&self.high, &self.normal, &self.low] {
            let mut entries = lane.entries.lock().await;
            for entry in entries.drain(..) {
                self.statuses.insert(entry.id, RequestState::Failed);
            }
        }
    }

    /// Mark a dispatched ticket's terminal outcome, for `RequestStatus(id)`.
    pub fn mark_completed(&self, id: Uuid) {
        self.statuses.insert(id, RequestState::Completed);
    }

    pub fn mark_failed(&self, id: Uuid) {
        self.statuses.insert(id, RequestState::Failed);
    }

    /// `RequestStatus(id)` (spec §4.4): state plus, while still queued,
    /// position in the combined dispatch order and an estimated wait
    /// derived from the rolling wait-time window.
    pub async fn request_status(&self, id: Uuid) -> Option<RequestStatusView> {
        let state = *self.statuses.get(&id)?;
        if state != RequestState::Queued {
            return Some(RequestStatusView { state, position: None, estimated_wait_ms: None });
        }

        let position = self.queued_position(id).await.unwrap_or(0);
        let avg_wait_ms = self.wait_samples.lock().await.average();
        Some(RequestStatusView {
            state,
            position: Some(position),
            estimated_wait_ms: Some(avg_wait_ms * (position as f64 + 1.0)),
        })
    }

    /// Zero-based count of entries that would dispatch before `id` —
    /// every HIGH/NORMAL entry ahead of a LOW one, every earlier entry
    /// within `id`'s own lane.
    async fn queued_position(&self, id: Uuid) -> Option<usize> {
        let high = self.high.entries.lock().await;
        if let Some(idx) = high.iter().position(|e| e.id == id) {
            return Some(idx);
        }
        let high_len = high.len();
        drop(high);

        let normal = self.normal.entries.lock().await;
        if let Some(idx) = normal.iter().position(|e| e.id == id) {
            return Some(high_len + idx);
        }
        let normal_len = normal.len();
        drop(normal);

        let low = self.low.entries.lock().await;
        low.iter().position(|e| e.id == id).map(|idx| high_len + normal_len + idx)
    }

    pub async fn depth_by_priority(&self) -> (usize, usize, usize) {
        (
            self.high.entries.lock().await.len(),
            self.normal.entries.lock().await.len(),
            self.low.entries.lock().await.len(),
        )
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let (high_depth, normal_depth, low_depth) = self.depth_by_priority().await;
        QueueMetrics {
            depth: high_depth + normal_depth + low_depth,
            high_depth,
            normal_depth,
            low_depth,
            avg_wait_ms: self.wait_samples.lock().await.average(),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_dequeued: self.total_dequeued.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dequeue_drains_high_before_normal_before_low() {
        let queue: PriorityQueue<&'static str> = PriorityQueue::new(10);
        queue.enqueue(Priority::Low, "low").await.unwrap();
        queue.enqueue(Priority::Normal, "normal").await.unwrap();
        queue.enqueue(Priority::High, "high").await.unwrap();

        let first = queue.dequeue(Duration::from_millis(100)).await.unwrap();
        let second = queue.dequeue(Duration::from_millis(100)).await.unwrap();
        let third = queue.dequeue(Duration::from_millis(100)).await.unwrap();

        assert_eq!(first.payload, "high");
        assert_eq!(second.payload, "normal");
        assert_eq!(third.payload, "low");
    }

    #[tokio::test]
    async fn fifo_ordering_within_a_single_priority() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(10);
        queue.enqueue(Priority::Normal, 1).await.unwrap();
        queue.enqueue(Priority::Normal, 2).await.unwrap();
        queue.enqueue(Priority::Normal, 3).await.unwrap();

        let a = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        let b = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        let c = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!((a.payload, b.payload, c.payload), (1, 2, 3));
    }

    #[tokio::test]
    async fn enqueue_past_max_size_returns_queue_full() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(1);
        queue.enqueue(Priority::Normal, 1).await.unwrap();
        let err = queue.enqueue(Priority::Normal, 2).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueFull);
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_times_out() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(10);
        let err = queue.dequeue(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimeoutQueue);
    }

    #[tokio::test]
    async fn remove_drops_a_queued_entry_before_it_is_dequeued() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(10);
        let id = queue.enqueue(Priority::Normal, 1).await.unwrap();
        assert!(queue.remove(id).await);
        let err = queue.dequeue(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::TimeoutQueue);
    }

    #[tokio::test]
    async fn metrics_report_depth_per_lane() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(10);
        queue.enqueue(Priority::High, 1).await.unwrap();
        queue.enqueue(Priority::Low, 2).await.unwrap();
        queue.enqueue(Priority::Low, 3).await.unwrap();

        let metrics = queue.metrics().await;
        assert_eq!(metrics.depth, 3);
        assert_eq!(metrics.high_depth, 1);
        assert_eq!(metrics.low_depth, 2);
    }

    #[tokio::test]
    async fn metrics_track_enqueued_dequeued_and_dropped_totals() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(1);
        queue.enqueue(Priority::Normal, 1).await.unwrap();
        let dropped = queue.enqueue(Priority::Normal, 2).await;
        assert_eq!(dropped.unwrap_err().kind, ErrorKind::QueueFull);
        queue.dequeue(Duration::from_millis(50)).await.unwrap();

        let metrics = queue.metrics().await;
        assert_eq!(metrics.total_enqueued, 1);
        assert_eq!(metrics.total_dequeued, 1);
        assert_eq!(metrics.total_dropped, 1);
    }

    #[tokio::test]
    async fn request_status_reports_position_then_processing_then_terminal() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(10);
        let first = queue.enqueue(Priority::Normal, 1).await.unwrap();
        let second = queue.enqueue(Priority::Normal, 2).await.unwrap();

        let status = queue.request_status(second).await.unwrap();
        assert_eq!(status.state, RequestState::Queued);
        assert_eq!(status.position, Some(1));

        let dequeued = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(dequeued.id, first);
        let status = queue.request_status(first).await.unwrap();
        assert_eq!(status.state, RequestState::Processing);
        assert_eq!(status.position, None);

        queue.mark_completed(first);
        assert_eq!(queue.request_status(first).await.unwrap().state, RequestState::Completed);

        queue.mark_failed(second);
        assert_eq!(queue.request_status(second).await.unwrap().state, RequestState::Failed);
    }

    #[tokio::test]
    async fn request_status_is_none_for_unknown_id() {
        let queue: PriorityQueue<u32> = PriorityQueue::new(10);
        assert!(queue.request_status(Uuid::new_v4()).await.is_none());
    }
}

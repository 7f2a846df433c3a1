//! Incoming request queue and batch configuration.

use super::executor::DispatchStrategy;
use super::types::PendingRequest;
use crate::config::{duration_secs, option_duration_secs};
use crate::similarity::DEFAULT_GROUPING_THRESHOLD;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Requests claimed per cycle, and the largest group formed.
    pub max_batch_size: usize,
    /// Longest a request waits for company before its cycle flushes.
    #[serde(with = "duration_secs")]
    pub max_wait_time: Duration,
    /// Minimum Jaccard score against a group's seed to join it.
    pub similarity_threshold: f64,
    /// Upper bound on any idle wait inside the scheduler.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub strategy: DispatchStrategy,
    /// Callback invocations running longer than this count as failures.
    #[serde(with = "option_duration_secs")]
    pub execution_timeout: Option<Duration>,
    /// Completed results (and failures) kept for status queries.
    pub result_retention: usize,
    /// How long `stop` waits for in-flight batches.
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            max_wait_time: Duration::from_secs(30),
            similarity_threshold: DEFAULT_GROUPING_THRESHOLD,
            poll_interval: Duration::from_secs(1),
            strategy: DispatchStrategy::default(),
            execution_timeout: None,
            result_retention: 1000,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_batch_size(mut self, s: usize) -> Self {
        self.max_batch_size = s;
        self
    }
    pub fn with_max_wait_time(mut self, d: Duration) -> Self {
        self.max_wait_time = d;
        self
    }
    pub fn with_similarity_threshold(mut self, t: f64) -> Self {
        self.similarity_threshold = t;
        self
    }
    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }
    pub fn with_strategy(mut self, s: DispatchStrategy) -> Self {
        self.strategy = s;
        self
    }
    pub fn with_execution_timeout(mut self, d: Option<Duration>) -> Self {
        self.execution_timeout = d;
        self
    }
    pub fn with_result_retention(mut self, n: usize) -> Self {
        self.result_retention = n;
        self
    }
    pub fn with_shutdown_grace(mut self, d: Duration) -> Self {
        self.shutdown_grace = d;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, details: String| {
            Err(Error::configuration_with_context(
                "invalid batch configuration",
                ErrorContext::new()
                    .with_field_path(format!("batch.{}", field))
                    .with_details(details)
                    .with_source("scheduler"),
            ))
        };
        if self.max_batch_size == 0 {
            return invalid("max_batch_size", "must be greater than zero".into());
        }
        if self.max_wait_time.is_zero() {
            return invalid("max_wait_time", "must be greater than zero".into());
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return invalid(
                "similarity_threshold",
                format!("got {}, expected 0.0..=1.0", self.similarity_threshold),
            );
        }
        if self.poll_interval.is_zero() {
            return invalid("poll_interval", "must be greater than zero".into());
        }
        if let DispatchStrategy::Concurrent { max_concurrency: 0 } = self.strategy {
            return invalid("strategy.max_concurrency", "must be greater than zero".into());
        }
        if matches!(self.execution_timeout, Some(t) if t.is_zero()) {
            return invalid("execution_timeout", "must be greater than zero when set".into());
        }
        if self.result_retention == 0 {
            return invalid("result_retention", "must be greater than zero".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct QueuedRequest {
    request: PendingRequest,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAddResult {
    Added { count: usize },
    ShouldFlush { count: usize },
}

impl QueueAddResult {
    pub fn should_flush(&self) -> bool {
        matches!(self, QueueAddResult::ShouldFlush { .. })
    }
    pub fn count(&self) -> usize {
        match self {
            QueueAddResult::Added { count } | QueueAddResult::ShouldFlush { count } => *count,
        }
    }
}

/// What the scheduler should do with the queue right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// A full batch is waiting, or the oldest request has waited long enough.
    Ready,
    /// Requests are waiting; flush at this instant unless the batch fills first.
    WaitUntil(Instant),
    Empty,
}

/// FIFO of pending requests shared by submitters and the scheduler.
///
/// The cycle's wait budget starts when its oldest request arrived, so a lone
/// request waits at most `max_wait_time`.
pub struct RequestQueue {
    max_batch_size: usize,
    max_wait_time: Duration,
    items: Mutex<VecDeque<QueuedRequest>>,
    notify: Notify,
}

impl RequestQueue {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            max_wait_time: config.max_wait_time,
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueuedRequest>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, request: PendingRequest) -> QueueAddResult {
        let count = {
            let mut items = self.items();
            items.push_back(QueuedRequest {
                request,
                enqueued_at: Instant::now(),
            });
            items.len()
        };
        self.notify.notify_one();
        if count >= self.max_batch_size {
            QueueAddResult::ShouldFlush { count }
        } else {
            QueueAddResult::Added { count }
        }
    }

    /// Puts requests back at the head of the queue, keeping their order.
    /// Used when resuming work from a snapshot.
    pub fn restore_front(&self, requests: Vec<PendingRequest>) {
        if requests.is_empty() {
            return;
        }
        {
            let mut items = self.items();
            let now = Instant::now();
            for request in requests.into_iter().rev() {
                items.push_front(QueuedRequest {
                    request,
                    enqueued_at: now,
                });
            }
        }
        self.notify.notify_one();
    }

    pub fn poll(&self) -> FlushDecision {
        let items = self.items();
        match items.front() {
            None => FlushDecision::Empty,
            Some(_) if items.len() >= self.max_batch_size => FlushDecision::Ready,
            Some(oldest) => {
                let deadline = oldest.enqueued_at + self.max_wait_time;
                if Instant::now() >= deadline {
                    FlushDecision::Ready
                } else {
                    FlushDecision::WaitUntil(deadline)
                }
            }
        }
    }

    pub fn should_flush(&self) -> bool {
        self.poll() == FlushDecision::Ready
    }

    /// Resolves after the next `push` (or immediately if one happened since
    /// the last wakeup was consumed).
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Removes up to `max_batch_size` requests from the head and hands them to
    /// `claim` while the queue is still locked, so no observer ever sees a
    /// request in neither the queue nor its new owner.
    pub fn drain_batch_with<R>(&self, claim: impl FnOnce(Vec<PendingRequest>) -> R) -> R {
        let mut items = self.items();
        let n = items.len().min(self.max_batch_size);
        let batch: Vec<PendingRequest> = items.drain(..n).map(|q| q.request).collect();
        claim(batch)
    }

    pub fn drain_batch(&self) -> Vec<PendingRequest> {
        self.drain_batch_with(|batch| batch)
    }

    /// Zero-based queue position and a copy of the request.
    pub fn position(&self, request_id: &str) -> Option<(usize, PendingRequest)> {
        self.items()
            .iter()
            .enumerate()
            .find(|(_, q)| q.request.id == request_id)
            .map(|(i, q)| (i, q.request.clone()))
    }

    pub fn snapshot(&self) -> Vec<PendingRequest> {
        self.items().iter().map(|q| q.request.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn clear(&self) {
        self.items().clear();
    }
}

//! Background dispatch loop.
//!
//! One task drives the cycle
//! `Collecting -> Grouping -> Dispatching -> Publishing -> Collecting`:
//!
//! - **Collecting** waits on the queue until a full batch is available or the
//!   oldest request has waited `max_wait_time`.
//! - **Grouping** claims up to `max_batch_size` requests and clusters them. The
//!   groups are registered as active before the queue lock is released.
//! - **Dispatching** runs the execution callback for every group, highest
//!   priority first, with no queue or store lock held.
//! - **Publishing** files each result in the registry and writes each answer
//!   back into the response store.

use super::aggregator;
use super::collector::{BatchConfig, FlushDecision, RequestQueue};
use super::executor::{execute_group, BatchExecutor};
use super::observer::{BatchObserver, ObserverRegistry};
use super::registry::{RequestStatus, StatusRegistry};
use super::types::{BatchGroup, BatchResult, PendingRequest};
use crate::cache::{CacheRecord, ResponseStore};
use crate::storage::{Document, StateBackend};
use crate::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Share of a merged batch's cost assumed saved versus separate calls.
pub const BATCHING_SAVINGS_RATIO: f64 = 0.3;

/// Contents of the `batch-state` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSnapshot {
    #[serde(default)]
    pub pending_requests: Vec<PendingRequest>,
    /// Groups claimed but not yet published.
    #[serde(default)]
    pub batch_groups: Vec<BatchGroup>,
    pub saved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub running: bool,
    pub queued_requests: usize,
    pub active_batches: usize,
    pub completed_batches: u64,
    pub failed_batches: u64,
    pub failed_requests: u64,
    pub total_requests_processed: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_batch_size: f64,
    pub avg_processing_ms: f64,
    pub estimated_savings: f64,
    pub persist_errors: u64,
}

pub struct DispatchScheduler {
    config: BatchConfig,
    queue: RequestQueue,
    registry: StatusRegistry,
    observers: ObserverRegistry,
    store: Arc<ResponseStore>,
    backend: Arc<dyn StateBackend>,
    executor: Arc<dyn BatchExecutor>,
    running: AtomicBool,
    // Serialises snapshot writes so an older snapshot never lands last.
    snapshot_lock: Mutex<()>,
    persist_errors: AtomicU64,
}

impl DispatchScheduler {
    pub fn new(
        config: BatchConfig,
        store: Arc<ResponseStore>,
        backend: Arc<dyn StateBackend>,
        executor: Arc<dyn BatchExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue: RequestQueue::new(&config),
            registry: StatusRegistry::new(config.result_retention),
            observers: ObserverRegistry::new(),
            config,
            store,
            backend,
            executor,
            running: AtomicBool::new(false),
            snapshot_lock: Mutex::new(()),
            persist_errors: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }
    pub fn registry(&self) -> &StatusRegistry {
        &self.registry
    }
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn register_observer(&self, name: impl Into<String>, observer: Arc<dyn BatchObserver>) {
        self.observers.register(name, observer);
    }
    pub fn unregister_observer(&self, name: &str) -> bool {
        self.observers.unregister(name)
    }

    /// Queues `request` and returns its id. The snapshot is rewritten before
    /// returning so the request survives a restart.
    pub async fn submit(&self, request: PendingRequest) -> Result<String> {
        request.validate()?;
        let id = request.id.clone();
        let priority = request.priority;
        let added = self.queue.push(request);
        debug!(request_id = %id, priority, queued = added.count(), "request queued");
        self.persist_snapshot().await;
        Ok(id)
    }

    /// Queue position first, then the registry. A claim moves requests into
    /// the registry while the queue is still locked, so a live request is
    /// always found in one of the two.
    pub fn status(&self, request_id: &str) -> RequestStatus {
        if let Some((position, request)) = self.queue.position(request_id) {
            return RequestStatus::Queued {
                position,
                submitted_at: request.submitted_at,
                priority: request.priority,
            };
        }
        self.registry.lookup(request_id)
    }

    /// Drops retained results completed more than `older_than` ago.
    pub fn prune_results(&self, older_than: Duration) -> usize {
        let age =
            chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        self.registry.prune_results(Utc::now() - age)
    }

    pub fn stats(&self) -> BatchStats {
        let totals = self.registry.totals();
        let published = totals.completed_batches + totals.failed_batches;
        BatchStats {
            running: self.is_running(),
            queued_requests: self.queue.len(),
            active_batches: self.registry.active_count(),
            completed_batches: totals.completed_batches,
            failed_batches: totals.failed_batches,
            failed_requests: totals.requests_failed,
            total_requests_processed: totals.requests_completed,
            total_tokens: totals.total_tokens,
            total_cost: totals.total_cost,
            avg_batch_size: if published == 0 {
                0.0
            } else {
                totals.total_members as f64 / published as f64
            },
            avg_processing_ms: if totals.completed_batches == 0 {
                0.0
            } else {
                totals.total_processing_ms as f64 / totals.completed_batches as f64
            },
            estimated_savings: totals.merged_cost * BATCHING_SAVINGS_RATIO,
            persist_errors: self.persist_errors.load(Ordering::Relaxed),
        }
    }

    /// Current pending requests and in-flight groups.
    ///
    /// The queue is read before the registry: a request claimed in between
    /// shows up twice (restore skips the repeat) but never goes missing.
    pub fn snapshot(&self) -> BatchSnapshot {
        let pending_requests = self.queue.snapshot();
        let batch_groups = self
            .registry
            .active_groups()
            .iter()
            .map(|g| BatchGroup::clone(g))
            .collect();
        BatchSnapshot {
            pending_requests,
            batch_groups,
            saved_at: Some(Utc::now()),
        }
    }

    async fn write_snapshot(&self, snapshot: &BatchSnapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        self.backend.write(Document::BatchState, &data).await
    }

    pub async fn persist_snapshot(&self) {
        let _guard = self.snapshot_lock.lock().await;
        let snapshot = self.snapshot();
        if let Err(e) = self.write_snapshot(&snapshot).await {
            self.persist_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, backend = self.backend.name(), "failed to persist batch state");
        }
    }

    /// Loads the batch-state document and re-queues its work: members of
    /// in-flight groups first, then pending requests, each id once. Returns
    /// how many requests were resumed. Unreadable state is logged and skipped.
    pub async fn restore(&self) -> usize {
        let data = match self.backend.read(Document::BatchState).await {
            Ok(Some(data)) => data,
            Ok(None) => return 0,
            Err(e) => {
                self.persist_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "could not load batch state");
                return 0;
            }
        };
        let snapshot: BatchSnapshot = match serde_json::from_slice(&data) {
            Ok(s) => s,
            Err(e) => {
                self.persist_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "batch state document is corrupt; ignoring it");
                return 0;
            }
        };

        let mut seen: HashSet<String> = self.queue.snapshot().into_iter().map(|r| r.id).collect();
        let resumed: Vec<PendingRequest> = snapshot
            .batch_groups
            .into_iter()
            .flat_map(|g| g.members)
            .chain(snapshot.pending_requests)
            .filter(|r| seen.insert(r.id.clone()))
            .collect();
        let count = resumed.len();
        self.queue.restore_front(resumed);
        if count > 0 {
            info!(requests = count, "resumed batch state");
        }
        count
    }

    /// Runs cycles until `cancel` fires. Cancellation only interrupts
    /// Collecting: groups already claimed are dispatched and published first.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            max_batch_size = self.config.max_batch_size,
            max_wait_ms = self.config.max_wait_time.as_millis() as u64,
            "dispatch scheduler started"
        );
        while self.collect(&cancel).await {
            let groups = self.claim();
            if groups.is_empty() {
                continue;
            }
            self.persist_snapshot().await;
            self.dispatch(groups).await;
            self.persist_snapshot().await;
        }
        self.running.store(false, Ordering::SeqCst);
        self.persist_snapshot().await;
        info!(queued = self.queue.len(), "dispatch scheduler stopped");
    }

    /// Returns `true` when a flush is due, `false` once cancelled.
    async fn collect(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let wake = match self.queue.poll() {
                FlushDecision::Ready => return true,
                FlushDecision::WaitUntil(deadline) => deadline,
                FlushDecision::Empty => Instant::now() + self.config.poll_interval,
            };
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn claim(&self) -> Vec<Arc<BatchGroup>> {
        let groups = self.queue.drain_batch_with(|batch| {
            if batch.is_empty() {
                return Vec::new();
            }
            let groups: Vec<Arc<BatchGroup>> = aggregator::group(
                batch,
                self.config.max_batch_size,
                self.config.similarity_threshold,
            )
            .into_iter()
            .map(Arc::new)
            .collect();
            self.registry.activate(&groups);
            groups
        });
        for group in &groups {
            debug!(
                batch_id = %group.id,
                size = group.len(),
                priority = group.priority,
                "batch ready"
            );
            self.observers.batch_ready(group);
        }
        groups
    }

    async fn dispatch(&self, mut groups: Vec<Arc<BatchGroup>>) {
        groups.sort_by(|a, b| b.priority.cmp(&a.priority));
        let executor = self.executor.as_ref();
        let timeout = self.config.execution_timeout;
        stream::iter(groups)
            .map(|group| async move {
                let result = execute_group(executor, &group, timeout).await;
                (group, result)
            })
            .buffer_unordered(self.config.strategy.max_in_flight())
            .for_each(|(group, result)| async move {
                self.publish(&group, result).await;
            })
            .await;
    }

    async fn publish(&self, group: &BatchGroup, result: Result<BatchResult>) {
        match result {
            Ok(result) => {
                let filed = self.registry.complete(group, result);
                for member in &group.members {
                    let Some(outcome) = filed.outcome(&member.id) else {
                        continue;
                    };
                    let mut record = CacheRecord::new(
                        &member.prompt,
                        member.context.as_deref(),
                        &outcome.response,
                        &outcome.model,
                        outcome.tokens_used,
                        outcome.cost,
                    )
                    .with_metadata("batch_id", serde_json::json!(filed.batch_id))
                    .with_metadata("request_id", serde_json::json!(member.id));
                    for (key, value) in &member.metadata {
                        record.metadata.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    self.store.put(record).await;
                }
                info!(
                    batch_id = %filed.batch_id,
                    size = group.len(),
                    tokens = filed.total_tokens,
                    cost = filed.total_cost,
                    elapsed_ms = filed.processing_time_ms,
                    "batch completed"
                );
                self.observers.batch_complete(&filed);
            }
            Err(e) => {
                self.registry.fail(group, &e.to_string());
                warn!(batch_id = %group.id, size = group.len(), error = %e, "batch failed");
                self.observers.batch_failed(group, &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::executor::{DispatchStrategy, FnExecutor};
    use crate::batch::simulated::SimulatedExecutor;
    use crate::batch::types::{RequestOutcome, PRIORITY_HIGH, PRIORITY_LOW};
    use crate::cache::StoreConfig;
    use crate::storage::MemoryBackend;

    async fn scheduler_with(
        config: BatchConfig,
        backend: Arc<dyn StateBackend>,
        executor: Arc<dyn BatchExecutor>,
    ) -> (Arc<DispatchScheduler>, Arc<ResponseStore>) {
        let store = Arc::new(ResponseStore::in_memory(StoreConfig::default()).await.unwrap());
        let scheduler = DispatchScheduler::new(config, store.clone(), backend, executor).unwrap();
        (Arc::new(scheduler), store)
    }

    fn start(
        scheduler: &Arc<DispatchScheduler>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(cancel.clone()));
        (cancel, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_identical_requests_share_one_batch() {
        let exec = Arc::new(SimulatedExecutor::new());
        let (scheduler, store) = scheduler_with(
            BatchConfig::new()
                .with_max_batch_size(5)
                .with_max_wait_time(Duration::from_secs(30)),
            Arc::new(MemoryBackend::new()),
            exec.clone(),
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        let mut ids = Vec::new();
        for prompt in [
            "explain rust ownership rules",
            "explain rust ownership rules please",
            "Explain Rust ownership rules",
        ] {
            ids.push(scheduler.submit(PendingRequest::new(prompt)).await.unwrap());
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(scheduler.status(&ids[0]).label(), "queued");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(exec.calls(), 1);
        assert_eq!(exec.members_seen(), 3);

        let batch_ids: HashSet<String> = ids
            .iter()
            .map(|id| match scheduler.status(id) {
                RequestStatus::Completed { batch_id, .. } => batch_id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(batch_ids.len(), 1);

        let cached = store.get("explain rust ownership rules", None, None).await.unwrap();
        assert!(cached.metadata.contains_key("batch_id"));
        assert_eq!(cached.quality_score, None);

        cancel.cancel();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_without_waiting() {
        let exec = Arc::new(SimulatedExecutor::new());
        let (scheduler, _) = scheduler_with(
            BatchConfig::new().with_max_batch_size(2),
            Arc::new(MemoryBackend::new()),
            exec.clone(),
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        scheduler.submit(PendingRequest::new("a b c")).await.unwrap();
        scheduler.submit(PendingRequest::new("a b c")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exec.calls(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_dispatch_highest_priority_first() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let exec = {
            let seen = seen.clone();
            FnExecutor::new(move |g: BatchGroup| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(g.priority);
                    Ok(BatchResult::new(g.id))
                }
            })
        };
        let (scheduler, _) = scheduler_with(
            BatchConfig::new(),
            Arc::new(MemoryBackend::new()),
            Arc::new(exec),
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        scheduler
            .submit(PendingRequest::new("alpha beta").with_priority(PRIORITY_LOW))
            .await
            .unwrap();
        scheduler
            .submit(PendingRequest::new("gamma delta").with_priority(PRIORITY_HIGH))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(*seen.lock().unwrap(), vec![PRIORITY_HIGH, PRIORITY_LOW]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_failure_marks_members_failed() {
        let exec = Arc::new(SimulatedExecutor::new());
        exec.set_failing(true);
        let (scheduler, store) = scheduler_with(
            BatchConfig::new().with_max_batch_size(2),
            Arc::new(MemoryBackend::new()),
            exec.clone(),
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        let a = scheduler.submit(PendingRequest::new("same prompt")).await.unwrap();
        let b = scheduler.submit(PendingRequest::new("same prompt")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        for id in [&a, &b] {
            match scheduler.status(id) {
                RequestStatus::Failed { error, .. } => {
                    assert!(error.contains("simulated backend failure"))
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(store.is_empty().await);
        let stats = scheduler.stats();
        assert_eq!(stats.failed_requests, 2);
        assert_eq!(stats.failed_batches, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    fn answer_all(group: &BatchGroup) -> BatchResult {
        let mut result = BatchResult::new(group.id.clone());
        for member in &group.members {
            result.add_outcome(member.id.clone(), RequestOutcome::new("done", "m", 2, 0.0));
        }
        result
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_panic_marks_members_failed() {
        let exec = FnExecutor::new(|g: BatchGroup| async move {
            if g.representative_prompt == "boom" {
                panic!("backend exploded");
            }
            Ok(answer_all(&g))
        });
        let (scheduler, store) = scheduler_with(
            BatchConfig::new().with_max_batch_size(1),
            Arc::new(MemoryBackend::new()),
            Arc::new(exec),
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        let a = scheduler.submit(PendingRequest::new("boom")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        match scheduler.status(&a) {
            RequestStatus::Failed { error, .. } => {
                assert!(error.contains("execution callback panicked: backend exploded"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(scheduler.registry().active_count(), 0);

        // the loop keeps serving later requests
        let b = scheduler.submit(PendingRequest::new("fine")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(scheduler.status(&b).label(), "completed");
        assert!(scheduler.is_running());
        assert!(store.get("fine", None, None).await.is_some());
        assert_eq!(scheduler.stats().failed_batches, 1);

        cancel.cancel();
        handle.await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_strategy_overlaps_groups() {
        let in_flight = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let exec = {
            let (in_flight, peak) = (in_flight.clone(), peak.clone());
            FnExecutor::new(move |g: BatchGroup| {
                let (in_flight, peak) = (in_flight.clone(), peak.clone());
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(answer_all(&g))
                }
            })
        };
        let (scheduler, store) = scheduler_with(
            BatchConfig::new()
                .with_max_batch_size(4)
                .with_strategy(DispatchStrategy::Concurrent { max_concurrency: 2 }),
            Arc::new(MemoryBackend::new()),
            Arc::new(exec),
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        let mut ids = Vec::new();
        for prompt in ["alpha beta", "gamma delta", "epsilon zeta", "eta theta"] {
            ids.push(scheduler.submit(PendingRequest::new(prompt)).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scheduler.registry().active_count(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        for id in &ids {
            assert_eq!(scheduler.status(id).label(), "completed");
        }
        assert_eq!(store.len().await, 4);
        assert_eq!(scheduler.stats().completed_batches, 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_timeout_marks_members_failed() {
        let exec = Arc::new(SimulatedExecutor::new().with_latency(Duration::from_secs(10)));
        let (scheduler, store) = scheduler_with(
            BatchConfig::new()
                .with_max_batch_size(2)
                .with_execution_timeout(Some(Duration::from_secs(1))),
            Arc::new(MemoryBackend::new()),
            exec,
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        let a = scheduler.submit(PendingRequest::new("slow prompt")).await.unwrap();
        let b = scheduler.submit(PendingRequest::new("slow prompt")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        for id in [&a, &b] {
            match scheduler.status(id) {
                RequestStatus::Failed { error, .. } => assert!(error.contains("timed out")),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(store.is_empty().await);
        assert_eq!(scheduler.stats().failed_requests, 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_requeues_in_flight_groups_first() {
        let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
        let exec = Arc::new(SimulatedExecutor::new());
        let (first, _) = scheduler_with(
            BatchConfig::new().with_max_batch_size(2),
            backend.clone(),
            exec.clone(),
        )
        .await;

        let claimed_a = first.submit(PendingRequest::new("one")).await.unwrap();
        let claimed_b = first.submit(PendingRequest::new("two")).await.unwrap();
        let pending = first.submit(PendingRequest::new("three")).await.unwrap();
        let groups = first.claim();
        assert_eq!(groups.len(), 2);
        first.persist_snapshot().await;

        let (second, _) = scheduler_with(BatchConfig::new(), backend, exec).await;
        assert_eq!(second.restore().await, 3);
        let order: Vec<String> = second.queue().snapshot().into_iter().map(|r| r.id).collect();
        assert_eq!(order, vec![claimed_a, claimed_b, pending.clone()]);
        assert!(matches!(second.status(&pending), RequestStatus::Queued { position: 2, .. }));

        // restoring twice does not duplicate work
        assert_eq!(second.restore().await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_ignored() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write(Document::BatchState, b"{ not json").await.unwrap();
        let (scheduler, _) =
            scheduler_with(BatchConfig::new(), backend, Arc::new(SimulatedExecutor::new())).await;
        assert_eq!(scheduler.restore().await, 0);
        assert_eq!(scheduler.stats().persist_errors, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_request() {
        let (scheduler, _) = scheduler_with(
            BatchConfig::new(),
            Arc::new(MemoryBackend::new()),
            Arc::new(SimulatedExecutor::new()),
        )
        .await;
        assert!(scheduler.submit(PendingRequest::new("x").with_priority(7)).await.is_err());
        assert!(scheduler.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_claimed_batch_finish() {
        let exec = Arc::new(SimulatedExecutor::new().with_latency(Duration::from_secs(2)));
        let (scheduler, _) = scheduler_with(
            BatchConfig::new().with_max_batch_size(1),
            Arc::new(MemoryBackend::new()),
            exec.clone(),
        )
        .await;
        let (cancel, handle) = start(&scheduler);

        let id = scheduler.submit(PendingRequest::new("slow one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.status(&id).label(), "batching");

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(scheduler.status(&id).label(), "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_after_merged_batch() {
        let exec = Arc::new(SimulatedExecutor::new());
        let (scheduler, _) = scheduler_with(
            BatchConfig::new().with_max_batch_size(2),
            Arc::new(MemoryBackend::new()),
            exec,
        )
        .await;
        let (cancel, handle) = start(&scheduler);
        scheduler.submit(PendingRequest::new("four words right here")).await.unwrap();
        scheduler.submit(PendingRequest::new("four words right here")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = scheduler.stats();
        assert_eq!(stats.completed_batches, 1);
        assert_eq!(stats.total_requests_processed, 2);
        assert_eq!(stats.total_tokens, 16);
        assert!((stats.avg_batch_size - 2.0).abs() < 1e-9);
        assert!((stats.estimated_savings - 16.0 * 0.00002 * BATCHING_SAVINGS_RATIO).abs() < 1e-12);

        cancel.cancel();
        handle.await.unwrap();
    }
}

//! The engine: response store, request queue and dispatch scheduler behind
//! one handle.

use crate::batch::{
    BatchExecutor, BatchObserver, BatchStats, DispatchScheduler, PendingRequest, RequestStatus,
};
use crate::cache::{CacheRecord, CacheStats, ResponseStore};
use crate::config::EngineConfig;
use crate::storage::{FileBackend, NullBackend, StateBackend};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builder for [`Engine`].
///
/// An executor is required. Persistence defaults to a [`FileBackend`] in
/// `state_dir` when one is configured, otherwise to nothing.
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn StateBackend>>,
    executor: Option<Arc<dyn BatchExecutor>>,
    observers: Vec<(String, Arc<dyn BatchObserver>)>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            backend: None,
            executor: None,
            observers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the backend derived from `state_dir`.
    pub fn with_backend(mut self, backend: Arc<dyn StateBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_executor(mut self, executor: impl BatchExecutor + 'static) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    pub fn with_shared_executor(mut self, executor: Arc<dyn BatchExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_observer(
        mut self,
        name: impl Into<String>,
        observer: Arc<dyn BatchObserver>,
    ) -> Self {
        self.observers.push((name.into(), observer));
        self
    }

    /// Validates the configuration, loads persisted state and re-queues any
    /// interrupted work. The scheduler is not started.
    pub async fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let executor = self.executor.ok_or_else(|| {
            Error::configuration_with_context(
                "an execution callback is required",
                ErrorContext::new()
                    .with_field_path("executor")
                    .with_source("engine_builder"),
            )
        })?;
        let backend: Arc<dyn StateBackend> = match (self.backend, &self.config.state_dir) {
            (Some(backend), _) => backend,
            (None, Some(dir)) => Arc::new(FileBackend::new(dir.clone())),
            (None, None) => Arc::new(NullBackend::new()),
        };

        let store =
            Arc::new(ResponseStore::open(self.config.store.clone(), backend.clone()).await?);
        let scheduler = Arc::new(DispatchScheduler::new(
            self.config.batch.clone(),
            store.clone(),
            backend.clone(),
            executor,
        )?);
        for (name, observer) in self.observers {
            scheduler.register_observer(name, observer);
        }
        let resumed = scheduler.restore().await;
        info!(
            backend = backend.name(),
            cached = store.len().await,
            resumed,
            "engine ready"
        );

        Ok(Engine {
            config: self.config,
            store,
            scheduler,
            worker: Mutex::new(None),
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of [`Engine::request`].
#[derive(Debug, Clone)]
pub enum Submission {
    /// Answered from the store; nothing was queued.
    Cached(CacheRecord),
    /// Queued under this request id.
    Queued(String),
}

impl Submission {
    pub fn is_cached(&self) -> bool {
        matches!(self, Submission::Cached(_))
    }
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Submission::Queued(id) => Some(id),
            Submission::Cached(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub entry_count: usize,
    pub queue_depth: usize,
    pub active_batches: usize,
    pub completed_batches: u64,
    /// Cache reuse savings plus estimated batching savings.
    pub estimated_savings: f64,
    pub cache: CacheStats,
    pub batch: BatchStats,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<ResponseStore>,
    scheduler: Arc<DispatchScheduler>,
    worker: Mutex<Option<Worker>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
    pub fn store(&self) -> &Arc<ResponseStore> {
        &self.store
    }
    pub fn scheduler(&self) -> &Arc<DispatchScheduler> {
        &self.scheduler
    }

    /// Spawns the scheduler task. Starting a running engine is a no-op.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                "engine must be started inside a tokio runtime",
                ErrorContext::new().with_details(e.to_string()),
            )
        })?;
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(self.scheduler.clone().run(cancel.clone()));
        *worker = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Stops collecting and waits up to `shutdown_grace` for batches already
    /// claimed. A scheduler still busy after that is detached: it finishes
    /// publishing in the background and then marks itself stopped. The
    /// snapshot written here still lists its groups, so they resume on the
    /// next start if the process exits first.
    pub async fn stop(&self) -> Result<()> {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Worker { cancel, handle }) = worker {
            cancel.cancel();
            let grace = self.config.batch.shutdown_grace;
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "scheduler task ended abnormally"),
                Err(_) => warn!(
                    grace_ms = grace.as_millis() as u64,
                    active = self.scheduler.registry().active_count(),
                    "in-flight batches did not finish within grace; detaching"
                ),
            }
        }
        self.scheduler.persist_snapshot().await;
        self.store.flush().await
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Queues a request for the next batch and returns its id.
    pub async fn submit(&self, request: PendingRequest) -> Result<String> {
        self.scheduler.submit(request).await
    }

    /// Consults the store first; only a miss is queued.
    pub async fn request(
        &self,
        request: PendingRequest,
        min_quality: Option<f64>,
    ) -> Result<Submission> {
        request.validate()?;
        if let Some(hit) = self
            .store
            .get(&request.prompt, request.context.as_deref(), min_quality)
            .await
        {
            return Ok(Submission::Cached(hit));
        }
        self.submit(request).await.map(Submission::Queued)
    }

    pub fn status(&self, request_id: &str) -> RequestStatus {
        self.scheduler.status(request_id)
    }

    pub async fn get_cached(
        &self,
        prompt: &str,
        context: Option<&str>,
        min_quality: Option<f64>,
    ) -> Option<CacheRecord> {
        self.store.get(prompt, context, min_quality).await
    }

    /// Stores a response produced outside the batch path.
    pub async fn store_response(&self, record: CacheRecord) -> String {
        self.store.put(record).await
    }

    /// Removes every cached response, or only those at least `older_than` old.
    pub async fn clear_cache(&self, older_than: Option<Duration>) -> usize {
        self.store.purge(older_than).await
    }

    pub async fn optimize_cache(&self) -> usize {
        self.store.optimize().await
    }

    pub async fn update_quality(&self, fingerprint: &str, score: f64) -> Result<bool> {
        self.store.update_quality(fingerprint, score).await
    }

    pub fn register_observer(&self, name: impl Into<String>, observer: Arc<dyn BatchObserver>) {
        self.scheduler.register_observer(name, observer);
    }

    pub fn unregister_observer(&self, name: &str) -> bool {
        self.scheduler.unregister_observer(name)
    }

    pub fn prune_results(&self, older_than: Duration) -> usize {
        self.scheduler.prune_results(older_than)
    }

    pub async fn stats(&self) -> EngineStats {
        let cache = self.store.stats().await;
        let batch = self.scheduler.stats();
        EngineStats {
            entry_count: cache.total_entries,
            queue_depth: batch.queued_requests,
            active_batches: batch.active_batches,
            completed_batches: batch.completed_batches,
            estimated_savings: cache.estimated_savings + batch.estimated_savings,
            cache,
            batch,
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let worker = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
        }
    }
}

//! Queue service facade.
//!
//! The only surface collaborators (HTTP handlers, the binary, tests) touch:
//! submit work, poll its status, cancel it. Owns the active backend, the
//! record store and one worker pool per configured queue.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use vstyle_models::{JobId, JobRecord, JobStatus, QueueName};
use vstyle_queue::{
    select_backend, BackendMode, JobStore, QueueBackend, QueueError, StatusChange, StatusCounts,
};

use crate::config::WorkerConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::metrics;
use crate::pool::{PoolContext, WorkerPool};
use crate::registry::{ErrorClassifier, WorkFunction, WorkRegistry};
use crate::runner::WorkRunner;

/// Shortest janitor period accepted.
const MIN_JANITOR_INTERVAL: Duration = Duration::from_millis(10);

/// A job submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub queue: QueueName,
    pub kind: String,
    pub payload: Value,
    /// Lower runs first
    pub priority: i32,
    /// Overrides the queue's configured attempt ceiling
    pub max_attempts: Option<u32>,
    /// Caller identity, handed to the admission policy
    pub owner: Option<String>,
}

impl SubmitRequest {
    pub fn new(queue: impl Into<QueueName>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            kind: kind.into(),
            payload,
            priority: 0,
            max_attempts: None,
            owner: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Decides whether a caller may submit more work (quota, plan, payment).
#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    async fn may_submit(&self, owner: Option<&str>, queue: &QueueName) -> bool;
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl AdmissionPolicy for AllowAll {
    async fn may_submit(&self, _owner: Option<&str>, _queue: &QueueName) -> bool {
        true
    }
}

/// Snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queue: QueueName,
    /// Jobs waiting in the backend, including scheduled retries
    pub depth: u64,
    pub workers: usize,
    /// Records held by this process, per status
    pub records: StatusCounts,
}

/// Builder for [`QueueService`].
pub struct QueueServiceBuilder {
    config: WorkerConfig,
    registry: WorkRegistry,
    store: Option<Arc<JobStore>>,
    backend: Option<Arc<dyn QueueBackend>>,
    admission: Arc<dyn AdmissionPolicy>,
}

impl QueueServiceBuilder {
    /// Register a work function for `(queue, kind)` with the default
    /// error classifier.
    pub fn register(
        mut self,
        queue: impl Into<QueueName>,
        kind: impl Into<String>,
        work: impl WorkFunction + 'static,
    ) -> Self {
        self.registry.register(queue, kind, work);
        self
    }

    pub fn register_with_classifier(
        mut self,
        queue: impl Into<QueueName>,
        kind: impl Into<String>,
        work: impl WorkFunction + 'static,
        classifier: impl ErrorClassifier + 'static,
    ) -> Self {
        self.registry
            .register_with_classifier(queue, kind, work, classifier);
        self
    }

    /// Use an existing record store.
    pub fn with_store(mut self, store: Arc<JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Skip the connectivity probe and use this backend.
    pub fn with_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_admission(mut self, admission: impl AdmissionPolicy + 'static) -> Self {
        self.admission = Arc::new(admission);
        self
    }

    /// Select the backend, then start the worker pools and the janitor.
    pub async fn start(self) -> ServiceResult<QueueService> {
        if let Some(queue) = self
            .registry
            .queues()
            .into_iter()
            .find(|queue| self.config.queue(queue).is_none())
        {
            return Err(ServiceError::config_error(format!(
                "work registered for unconfigured queue {}",
                queue
            )));
        }

        let backend = match self.backend {
            Some(backend) => backend,
            None => select_backend(self.config.redis.clone()).await,
        };
        let store = self.store.unwrap_or_default();
        let registry = Arc::new(self.registry);
        let config = self.config;

        let ctx = Arc::new(PoolContext {
            store: Arc::clone(&store),
            backend: Arc::clone(&backend),
            runner: WorkRunner::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::clone(&backend),
                config.job_timeout,
            )
            .with_cancel_poll(config.poll_wait),
            poll_wait: config.poll_wait,
            error_policy: config.backend_error_policy,
            retry_delay: config.backend_retry_delay,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pools = config
            .queues
            .iter()
            .map(|(queue, settings)| {
                WorkerPool::spawn(
                    queue.clone(),
                    settings.clone(),
                    Arc::clone(&ctx),
                    shutdown_rx.clone(),
                )
            })
            .collect();

        let janitor = spawn_janitor(
            Arc::clone(&store),
            config.record_retention,
            config.janitor_interval,
            shutdown_rx,
        );

        info!(
            backend = %backend.mode(),
            queues = config.queues.len(),
            "Queue service started"
        );

        Ok(QueueService {
            config,
            registry,
            store,
            backend,
            admission: self.admission,
            shutdown_tx,
            pools: Mutex::new(pools),
            janitor: Mutex::new(Some(janitor)),
        })
    }
}

/// Job queue facade.
pub struct QueueService {
    config: WorkerConfig,
    registry: Arc<WorkRegistry>,
    store: Arc<JobStore>,
    backend: Arc<dyn QueueBackend>,
    admission: Arc<dyn AdmissionPolicy>,
    shutdown_tx: watch::Sender<bool>,
    pools: Mutex<Vec<WorkerPool>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl QueueService {
    pub fn builder(config: WorkerConfig) -> QueueServiceBuilder {
        QueueServiceBuilder {
            config,
            registry: WorkRegistry::new(),
            store: None,
            backend: None,
            admission: Arc::new(AllowAll),
        }
    }

    /// Validate, record and enqueue a job. Returns as soon as the job is
    /// queued.
    pub async fn submit(&self, request: SubmitRequest) -> ServiceResult<JobId> {
        let settings = self
            .config
            .queue(&request.queue)
            .ok_or_else(|| ServiceError::UnknownQueue(request.queue.clone()))?;

        let registration = self
            .registry
            .get(&request.queue, &request.kind)
            .ok_or_else(|| ServiceError::UnknownKind {
                queue: request.queue.clone(),
                kind: request.kind.clone(),
            })?;

        registration
            .work
            .validate(&request.payload)
            .map_err(ServiceError::InvalidPayload)?;

        if !self
            .admission
            .may_submit(request.owner.as_deref(), &request.queue)
            .await
        {
            warn!(owner = ?request.owner, queue = %request.queue, "Submission rejected by admission policy");
            return Err(ServiceError::quota_exceeded(format!(
                "submission to {} not allowed",
                request.queue
            )));
        }

        let record = JobRecord::new(request.queue, request.kind, request.payload)
            .with_priority(request.priority)
            .with_max_attempts(request.max_attempts.unwrap_or(settings.max_attempts))
            .with_owner(request.owner);
        let record = self.store.create(record)?;

        if let Err(e) = self.backend.enqueue(&record).await {
            error!(job_id = %record.id, error = %e, "Enqueue failed, marking job failed");
            if self
                .store
                .transition(&record.id, StatusChange::Fail(format!("enqueue failed: {}", e)))
                .is_ok()
            {
                metrics::record_job_failed(&record.queue);
            }
            return Err(e.into());
        }

        metrics::record_job_submitted(&record.queue);
        info!(
            job_id = %record.id,
            queue = %record.queue,
            kind = %record.kind,
            priority = record.priority,
            "Job submitted"
        );
        Ok(record.id)
    }

    /// Current record of a job. Never waits on running work.
    ///
    /// On a durable backend a non-terminal local record is refreshed from
    /// the shared snapshot, since another process may be running the job.
    pub async fn get_status(&self, id: &JobId) -> ServiceResult<JobRecord> {
        let record = match self.store.get(id) {
            Ok(record) if record.is_terminal() => record,
            Ok(record) => self.refresh_from_backend(id).await.unwrap_or(record),
            Err(QueueError::NotFound(_)) => self
                .backend
                .load_snapshot(id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(id.clone()))?,
            Err(e) => return Err(e.into()),
        };

        if record.is_terminal() {
            self.store.mark_observed(id);
        }
        Ok(record)
    }

    /// Cancel a queued or active job.
    ///
    /// Cancelling an already cancelled job succeeds; a completed or failed
    /// job yields `AlreadyTerminal`.
    pub async fn cancel(&self, id: &JobId) -> ServiceResult<()> {
        if self.store.contains(id) {
            self.refresh_from_backend(id).await;
        } else {
            // Created by another process sharing the durable backend.
            let snapshot = self
                .backend
                .load_snapshot(id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(id.clone()))?;
            self.store.adopt(snapshot);
        }

        let cancelled = match self.store.transition(id, StatusChange::Cancel) {
            Ok(record) => record,
            Err(QueueError::InvalidTransition {
                from: JobStatus::Cancelled,
                ..
            }) => return Ok(()),
            Err(QueueError::InvalidTransition { id, from, .. }) => {
                return Err(ServiceError::AlreadyTerminal { id, status: from })
            }
            Err(QueueError::NotFound(id)) => return Err(ServiceError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        metrics::record_job_cancelled(&cancelled.queue);
        info!(job_id = %id, queue = %cancelled.queue, "Job cancelled");

        if let Err(e) = self.backend.ack(id).await {
            // Slots skip terminal records, so a leftover entry is harmless.
            warn!(job_id = %id, error = %e, "Failed to remove cancelled job from backend");
        }
        if let Err(e) = self.backend.store_snapshot(&cancelled).await {
            warn!(job_id = %id, error = %e, "Failed to mirror cancelled job snapshot");
        }
        Ok(())
    }

    /// Per-queue depth, pool size and record counts.
    pub async fn stats(&self) -> ServiceResult<Vec<QueueStats>> {
        let mut stats = Vec::with_capacity(self.config.queues.len());
        for (queue, settings) in &self.config.queues {
            let depth = self.backend.len(queue).await?;
            metrics::set_queue_depth(queue, depth);
            stats.push(QueueStats {
                queue: queue.clone(),
                depth,
                workers: settings.workers,
                records: self.store.counts(Some(queue)),
            });
        }
        Ok(stats)
    }

    /// Merge the durable snapshot into the local record. `None` when the
    /// backend keeps no snapshots or it could not be read.
    async fn refresh_from_backend(&self, id: &JobId) -> Option<JobRecord> {
        if self.backend.mode() != BackendMode::Durable {
            return None;
        }

        match self.backend.load_snapshot(id).await {
            Ok(snapshot) => snapshot.map(|snapshot| self.store.refresh(snapshot)),
            Err(e) => {
                warn!(job_id = %id, error = %e, "Failed to load job snapshot, using local record");
                None
            }
        }
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.backend.mode()
    }

    /// Record store shared with the worker pools.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Stop taking jobs and wait for in-flight attempts, up to the configured
    /// shutdown timeout. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send(true).is_err() {
            debug!("Worker slots and janitor already stopped");
        }

        let pools = std::mem::take(&mut *self.pools.lock().unwrap_or_else(PoisonError::into_inner));
        let janitor = self
            .janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if pools.is_empty() && janitor.is_none() {
            return;
        }

        info!(
            timeout_secs = self.config.shutdown_timeout.as_secs(),
            "Shutting down queue service"
        );

        let timeout = self.config.shutdown_timeout;
        join_all(pools.into_iter().map(|pool| pool.join(timeout))).await;

        if let Some(janitor) = janitor {
            if let Err(e) = janitor.await {
                warn!(error = %e, "Janitor task ended abnormally");
            }
        }
        info!("Queue service stopped");
    }
}

fn spawn_janitor(
    store: Arc<JobStore>,
    retention: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_JANITOR_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = store.prune(retention);
                    if removed > 0 {
                        debug!(removed, remaining = store.len(), "Janitor pruned job records");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

//! Worker pool: a fixed number of slots servicing one queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use vstyle_models::{JobId, JobRecord, JobStatus, QueueName};
use vstyle_queue::{JobStore, QueueBackend, QueueResult, StatusChange};

use crate::config::{BackendErrorPolicy, QueueSettings};
use crate::retry::{retry_async, FailureTracker, RetryConfig};
use crate::runner::{Verdict, WorkRunner};

/// Failures logged in a row before a slot goes quiet.
const MAX_LOGGED_FAILURES: u32 = 5;

/// Everything a slot needs, shared by all slots of a pool.
pub(crate) struct PoolContext {
    pub store: Arc<JobStore>,
    pub backend: Arc<dyn QueueBackend>,
    pub runner: WorkRunner,
    pub poll_wait: Duration,
    pub error_policy: BackendErrorPolicy,
    pub retry_delay: Duration,
}

/// Slots for one named queue.
pub struct WorkerPool {
    queue: QueueName,
    workers: usize,
    slots: JoinSet<()>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        queue: QueueName,
        settings: QueueSettings,
        ctx: Arc<PoolContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut slots = JoinSet::new();
        for slot in 0..settings.workers {
            let slot = Slot {
                queue: queue.clone(),
                index: slot,
                settings: settings.clone(),
                ctx: Arc::clone(&ctx),
                shutdown: shutdown.clone(),
                bookkeeping: RetryConfig::new(format!("{}_bookkeeping", queue))
                    .with_max_retries(3),
            };
            slots.spawn(slot.run());
        }

        info!(queue = %queue, workers = settings.workers, "Worker pool started");
        Self {
            queue,
            workers: settings.workers,
            slots,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Wait for every slot to exit, aborting the rest after `timeout`.
    pub async fn join(mut self, timeout: Duration) {
        let drained = tokio::time::timeout(timeout, async {
            while let Some(joined) = self.slots.join_next().await {
                if let Err(e) = joined {
                    error!(queue = %self.queue, error = %e, "Worker slot ended abnormally");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                queue = %self.queue,
                remaining = self.slots.len(),
                "Shutdown timeout reached, aborting in-flight jobs"
            );
            self.slots.shutdown().await;
        } else {
            info!(queue = %self.queue, "Worker pool stopped");
        }
    }
}

struct Slot {
    queue: QueueName,
    index: usize,
    settings: QueueSettings,
    ctx: Arc<PoolContext>,
    shutdown: watch::Receiver<bool>,
    bookkeeping: RetryConfig,
}

impl Slot {
    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    async fn run(self) {
        debug!(queue = %self.queue, slot = self.index, "Worker slot started");
        let mut failures = FailureTracker::new(MAX_LOGGED_FAILURES);

        while !self.stopping() {
            let record = match self.ctx.backend.dequeue(&self.queue, self.ctx.poll_wait).await {
                Ok(Some(record)) => {
                    failures.record_success();
                    record
                }
                Ok(None) => {
                    failures.record_success();
                    continue;
                }
                Err(e) => {
                    if failures.record_failure() {
                        warn!(queue = %self.queue, slot = self.index, error = %e, "Dequeue failed");
                    }
                    match self.ctx.error_policy {
                        BackendErrorPolicy::Retry => {
                            tokio::time::sleep(self.ctx.retry_delay).await;
                            continue;
                        }
                        BackendErrorPolicy::Halt => {
                            error!(
                                queue = %self.queue,
                                slot = self.index,
                                error = %e,
                                "Queue backend failed, halting worker slot"
                            );
                            break;
                        }
                    }
                }
            };

            if let Err(e) = self.process(record).await {
                error!(queue = %self.queue, slot = self.index, error = %e, "Job processing error");
            }
        }

        debug!(queue = %self.queue, slot = self.index, "Worker slot stopped");
    }

    async fn process(&self, dequeued: JobRecord) -> QueueResult<()> {
        let id = dequeued.id.clone();
        let current = self.ctx.store.refresh(dequeued);

        if current.is_terminal() {
            // Cancelled while waiting in the queue, possibly by another process.
            debug!(job_id = %id, status = %current.status, "Skipping terminal job");
            self.ack(&id).await;
            return Ok(());
        }

        let active = match self.ctx.store.transition(&id, StatusChange::Activate) {
            Ok(active) => active,
            Err(e) if e.is_cancel_race() => {
                self.ack(&id).await;
                return Ok(());
            }
            Err(e) => {
                self.ack(&id).await;
                return Err(e);
            }
        };
        self.mirror(&active).await;

        if active.status == JobStatus::Failed {
            warn!(
                job_id = %id,
                attempt = active.attempt,
                max_attempts = active.max_attempts,
                "Dequeued job with no attempts left, marking failed"
            );
            crate::metrics::record_job_failed(&self.queue);
            self.ack(&id).await;
            return Ok(());
        }

        let verdict = match self.ctx.runner.run(&active, &self.settings).await {
            Ok(verdict) => verdict,
            Err(e) => {
                self.ack(&id).await;
                return Err(e);
            }
        };

        // A retry must be mirrored as `queued` before it is re-queued.
        if let Ok(latest) = self.ctx.store.get(&id) {
            self.mirror(&latest).await;
        }

        match verdict {
            Verdict::Retrying(delay) => {
                let backend = &self.ctx.backend;
                let job_id = &id;
                let requeued = retry_async(&self.bookkeeping, || async move {
                    backend.requeue_after(job_id, delay).await
                })
                .await
                .into_result();

                if let Err(e) = requeued {
                    error!(job_id = %id, error = %e, "Could not schedule retry, failing job");
                    let change = StatusChange::Fail(format!("retry scheduling failed: {}", e));
                    if let Ok(failed) = self.ctx.store.transition(&id, change) {
                        crate::metrics::record_job_failed(&self.queue);
                        self.mirror(&failed).await;
                    }
                    self.ack(&id).await;
                }
            }
            Verdict::Completed | Verdict::Failed | Verdict::Discarded => {
                self.ack(&id).await;
            }
        }

        Ok(())
    }

    async fn ack(&self, id: &JobId) {
        let backend = &self.ctx.backend;
        let result = retry_async(&self.bookkeeping, || async move { backend.ack(id).await })
            .await
            .into_result();
        if let Err(e) = result {
            warn!(job_id = %id, error = %e, "Failed to ack job");
        }
    }

    /// Copy the record to the backend's snapshot store.
    async fn mirror(&self, record: &JobRecord) {
        let backend = &self.ctx.backend;
        let result = retry_async(&self.bookkeeping, || async move {
            backend.store_snapshot(record).await
        })
        .await
        .into_result();
        if let Err(e) = result {
            warn!(job_id = %record.id, error = %e, "Failed to mirror job snapshot");
        }
    }
}

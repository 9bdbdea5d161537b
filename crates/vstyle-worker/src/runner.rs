//! Work runner: executes one attempt of a job and records its outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, Instrument};

use vstyle_models::{JobId, JobRecord, JobStatus};
use vstyle_queue::{BackendMode, JobStore, QueueBackend, QueueError, QueueResult, StatusChange};

use crate::config::QueueSettings;
use crate::error::WorkError;
use crate::logging::JobLogger;
use crate::metrics;
use crate::progress::ProgressReporter;
use crate::registry::{Registration, Retryability, WorkRegistry};

/// What happened to an attempt, from the pool's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Work succeeded; the record is `completed`.
    Completed,
    /// Retryable failure; the record is back to `queued` and should be
    /// re-enqueued after the delay.
    Retrying(Duration),
    /// The record is `failed`.
    Failed,
    /// The job was cancelled; the outcome was thrown away.
    Discarded,
}

/// How often a running job checks the durable snapshot for a cancel
/// issued by another process.
const DEFAULT_CANCEL_POLL: Duration = Duration::from_millis(500);

/// Shortest snapshot poll period accepted.
const MIN_CANCEL_POLL: Duration = Duration::from_millis(10);

/// How the work task ended.
enum Outcome {
    Finished(Result<Value, WorkError>),
    Interrupted,
}

/// Runs registered work functions against active job records.
#[derive(Clone)]
pub struct WorkRunner {
    store: Arc<JobStore>,
    registry: Arc<WorkRegistry>,
    backend: Arc<dyn QueueBackend>,
    job_timeout: Duration,
    cancel_poll: Duration,
}

impl WorkRunner {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<WorkRegistry>,
        backend: Arc<dyn QueueBackend>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            backend,
            job_timeout,
            cancel_poll: DEFAULT_CANCEL_POLL,
        }
    }

    pub fn with_cancel_poll(mut self, cancel_poll: Duration) -> Self {
        self.cancel_poll = cancel_poll;
        self
    }

    /// Run one attempt of an `active` job.
    ///
    /// Exactly one transition is written per call, unless the job was
    /// cancelled meanwhile, in which case nothing is written. A work
    /// function returning `Cancelled` on its own is a fatal failure.
    pub async fn run(&self, record: &JobRecord, settings: &QueueSettings) -> QueueResult<Verdict> {
        let logger = JobLogger::new(record);
        logger.log_start(record.attempt, record.max_attempts);

        let Some(registration) = self.registry.get(&record.queue, &record.kind).cloned() else {
            let message = format!(
                "no work function registered for {}/{}",
                record.queue, record.kind
            );
            return self.settle_failure(record, &logger, settings, message, Retryability::Fatal);
        };

        let cancel = self.store.cancellation_token(&record.id)?;
        let reporter = ProgressReporter::new(Arc::clone(&self.store), record.id.clone(), cancel.clone());
        let started = Instant::now();

        let work = Arc::clone(&registration.work);
        let payload = record.payload.clone();
        let mut handle =
            tokio::spawn(async move { work.run(payload, reporter).await }.instrument(logger.create_span()));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                Outcome::Interrupted
            }
            _ = self.watch_remote_cancel(&record.id) => {
                handle.abort();
                Outcome::Interrupted
            }
            joined = tokio::time::timeout(self.job_timeout, &mut handle) => match joined {
                Ok(Ok(result)) => Outcome::Finished(result),
                Ok(Err(join_error)) => Outcome::Finished(Err(join_failure(join_error))),
                Err(_) => {
                    handle.abort();
                    Outcome::Finished(Err(WorkError::TimedOut(self.job_timeout)))
                }
            },
        };

        if !matches!(outcome, Outcome::Interrupted) {
            self.sync_remote_cancel(&record.id).await;
        }

        match outcome {
            Outcome::Interrupted => {
                logger.log_discarded();
                Ok(Verdict::Discarded)
            }
            Outcome::Finished(Ok(value)) => {
                let elapsed = started.elapsed();
                let verdict = self.settle_success(record, value)?;
                if verdict == Verdict::Completed {
                    logger.log_completion(elapsed.as_millis() as u64);
                    metrics::record_job_completed(&record.queue, elapsed.as_secs_f64());
                } else {
                    logger.log_discarded();
                }
                Ok(verdict)
            }
            Outcome::Finished(Err(e)) => {
                let retryability = classify(&registration, &e);
                self.settle_failure(record, &logger, settings, e.to_string(), retryability)
            }
        }
    }

    /// Apply a cancel written to the durable snapshot by another process.
    /// Returns true once the local record is cancelled.
    async fn sync_remote_cancel(&self, id: &JobId) -> bool {
        if self.backend.mode() != BackendMode::Durable {
            return false;
        }

        match self.backend.load_snapshot(id).await {
            Ok(Some(snapshot)) if snapshot.status == JobStatus::Cancelled => {
                self.store.refresh(snapshot).status == JobStatus::Cancelled
            }
            Ok(_) => false,
            Err(e) => {
                debug!(job_id = %id, error = %e, "Could not check snapshot for cancellation");
                false
            }
        }
    }

    /// Resolves once another process cancels the job. Never resolves on an
    /// in-process backend.
    async fn watch_remote_cancel(&self, id: &JobId) {
        if self.backend.mode() != BackendMode::Durable {
            return std::future::pending().await;
        }

        let mut ticker = tokio::time::interval(self.cancel_poll.max(MIN_CANCEL_POLL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.sync_remote_cancel(id).await {
                return;
            }
        }
    }

    fn settle_success(&self, record: &JobRecord, value: Value) -> QueueResult<Verdict> {
        if self.store.get(&record.id)?.status == JobStatus::Cancelled {
            return Ok(Verdict::Discarded);
        }

        match self.store.transition(&record.id, StatusChange::Complete(value)) {
            Ok(_) => Ok(Verdict::Completed),
            Err(e) if e.is_cancel_race() => Ok(Verdict::Discarded),
            Err(e) => Err(log_invalid(e)),
        }
    }

    fn settle_failure(
        &self,
        record: &JobRecord,
        logger: &JobLogger,
        settings: &QueueSettings,
        message: String,
        retryability: Retryability,
    ) -> QueueResult<Verdict> {
        if self.store.get(&record.id)?.status == JobStatus::Cancelled {
            logger.log_discarded();
            return Ok(Verdict::Discarded);
        }

        let change = match retryability {
            Retryability::Retryable => StatusChange::Retry(message.clone()),
            Retryability::Fatal => StatusChange::Fail(message.clone()),
        };

        let updated = match self.store.transition(&record.id, change) {
            Ok(updated) => updated,
            Err(e) if e.is_cancel_race() => {
                logger.log_discarded();
                return Ok(Verdict::Discarded);
            }
            Err(e) => return Err(log_invalid(e)),
        };

        if updated.status == JobStatus::Queued {
            let delay = settings.backoff.delay(updated.attempt.saturating_sub(1));
            logger.log_retry(&message, delay.as_millis() as u64);
            metrics::record_job_retried(&record.queue);
            Ok(Verdict::Retrying(delay))
        } else {
            logger.log_error(&message);
            metrics::record_job_failed(&record.queue);
            Ok(Verdict::Failed)
        }
    }
}

fn classify(registration: &Registration, error: &WorkError) -> Retryability {
    match error {
        // Timeouts are retried whatever the work function's classifier says.
        WorkError::TimedOut(_) => Retryability::Retryable,
        WorkError::Panicked(_) | WorkError::Cancelled => Retryability::Fatal,
        other => registration.classifier.classify(other),
    }
}

fn join_failure(join_error: JoinError) -> WorkError {
    if !join_error.is_panic() {
        return WorkError::failed("work task was aborted by the runtime");
    }

    let panic = join_error.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    WorkError::Panicked(message)
}

fn log_invalid(e: QueueError) -> QueueError {
    error!(error = %e, "Unexpected job transition");
    e
}

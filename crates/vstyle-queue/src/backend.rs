//! Queue backend abstraction and one-time backend selection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use vstyle_models::{JobId, JobRecord, QueueName};

use crate::durable::{RedisBackend, RedisConfig};
use crate::error::QueueResult;
use crate::memory::MemoryBackend;

/// Which backend implementation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendMode {
    /// Persistent broker shared by every worker process.
    Durable,
    /// Memory-resident fallback; nothing survives a restart.
    InProcess,
}

impl BackendMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Durable => "durable",
            BackendMode::InProcess => "in_process",
        }
    }
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Storage and transport for queued jobs.
///
/// A backend only holds jobs that are waiting or in flight; the canonical
/// status of a job lives in the [`JobStore`](crate::JobStore).
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Which implementation this is.
    fn mode(&self) -> BackendMode;

    /// Add a job to its queue, ordered by `(priority, submission order)`.
    async fn enqueue(&self, record: &JobRecord) -> QueueResult<()>;

    /// Take the next job from `queue`, waiting up to `wait` for one to
    /// become available.
    async fn dequeue(&self, queue: &QueueName, wait: Duration) -> QueueResult<Option<JobRecord>>;

    /// Remove a job from the backend, whether queued or in flight.
    async fn ack(&self, id: &JobId) -> QueueResult<()>;

    /// Put an in-flight job back on its queue once `delay` has elapsed.
    async fn requeue_after(&self, id: &JobId, delay: Duration) -> QueueResult<()>;

    /// Number of jobs waiting in `queue`, including scheduled retries.
    async fn len(&self, queue: &QueueName) -> QueueResult<u64>;

    /// Persist the latest record snapshot, if the backend keeps records.
    async fn store_snapshot(&self, _record: &JobRecord) -> QueueResult<()> {
        Ok(())
    }

    /// Load a persisted record snapshot.
    async fn load_snapshot(&self, _id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(None)
    }
}

/// Pick the backend for this process.
///
/// Probes Redis when it is configured; any failure falls back to the
/// in-process queue. The choice holds for the life of the process.
pub async fn select_backend(config: Option<RedisConfig>) -> Arc<dyn QueueBackend> {
    let Some(config) = config else {
        warn!("No REDIS_URL configured, running in degraded mode with the in-process queue");
        return Arc::new(MemoryBackend::new());
    };

    match RedisBackend::connect(config).await {
        Ok(backend) => {
            info!("Using durable Redis queue backend");
            Arc::new(backend)
        }
        Err(e) => {
            warn!(
                error = %e,
                "Durable queue backend unreachable, running in degraded mode with the in-process queue; queued jobs will not survive a restart"
            );
            Arc::new(MemoryBackend::new())
        }
    }
}

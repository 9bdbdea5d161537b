//! Progress reporting handed to work functions.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use vstyle_models::JobId;
use vstyle_queue::JobStore;

use crate::error::{WorkError, WorkResult};

/// Handle a work function uses to report progress and notice cancellation.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<JobStore>,
    job_id: JobId,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub fn new(store: Arc<JobStore>, job_id: JobId, cancel: CancellationToken) -> Self {
        Self {
            store,
            job_id,
            cancel,
        }
    }

    /// Record progress (0-100).
    ///
    /// Returns `Err(WorkError::Cancelled)` once the job has been cancelled, so
    /// work functions can bail out with `?`.
    pub fn report(&self, progress: u8) -> WorkResult<()> {
        if self.cancel.is_cancelled() {
            return Err(WorkError::Cancelled);
        }

        if let Err(e) = self.store.update_progress(&self.job_id, progress) {
            // Pruned or never stored; nothing to update.
            debug!(job_id = %self.job_id, error = %e, "Progress update dropped");
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the job is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }
}

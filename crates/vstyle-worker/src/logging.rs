//! Structured job logging utilities.
//!
//! Provides consistent, structured logging for job processing with
//! tracing spans and contextual information.

use tracing::{error, info, warn, Span};
use vstyle_models::JobRecord;

/// Job logger for structured logging with consistent formatting.
///
/// Carries the job id, queue and kind so every lifecycle line of an attempt
/// can be correlated.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    queue: String,
    kind: String,
}

impl JobLogger {
    /// Create a logger for a job record.
    pub fn new(record: &JobRecord) -> Self {
        Self {
            job_id: record.id.to_string(),
            queue: record.queue.to_string(),
            kind: record.kind.clone(),
        }
    }

    /// Log the start of an attempt.
    pub fn log_start(&self, attempt: u32, max_attempts: u32) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            kind = %self.kind,
            attempt,
            max_attempts,
            "Job started"
        );
    }

    /// Log a retryable failure.
    pub fn log_retry(&self, error: &str, delay_ms: u64) {
        warn!(
            job_id = %self.job_id,
            queue = %self.queue,
            kind = %self.kind,
            delay_ms,
            "Job attempt failed, retrying: {}", error
        );
    }

    /// Log a terminal failure.
    pub fn log_error(&self, error: &str) {
        error!(
            job_id = %self.job_id,
            queue = %self.queue,
            kind = %self.kind,
            "Job failed: {}", error
        );
    }

    /// Log a discarded outcome (the job was cancelled mid-run).
    pub fn log_discarded(&self) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            kind = %self.kind,
            "Job cancelled while running, outcome discarded"
        );
    }

    /// Log a successful completion.
    pub fn log_completion(&self, elapsed_ms: u64) {
        info!(
            job_id = %self.job_id,
            queue = %self.queue,
            kind = %self.kind,
            elapsed_ms,
            "Job completed"
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Create a tracing span for this job.
    ///
    /// The runner instruments the work task with it, so logs emitted inside
    /// a work function carry the job context.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            queue = %self.queue,
            kind = %self.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_logger_creation() {
        let record = JobRecord::new("render", "template", json!({}));
        let logger = JobLogger::new(&record);

        assert_eq!(logger.job_id(), record.id.to_string());
        assert_eq!(logger.queue(), "render");
    }
}

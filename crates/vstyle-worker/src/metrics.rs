//! Prometheus metrics for the job queue.
//!
//! Every call goes through the `metrics` facade, so without an installed
//! recorder they are no-ops.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use vstyle_models::QueueName;

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_SUBMITTED_TOTAL: &str = "vstyle_jobs_submitted_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vstyle_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vstyle_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "vstyle_jobs_retried_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "vstyle_jobs_cancelled_total";
    pub const QUEUE_DEPTH: &str = "vstyle_queue_depth";
    pub const JOB_DURATION_SECONDS: &str = "vstyle_job_duration_seconds";
}

fn queue_labels(queue: &QueueName) -> [(&'static str, String); 1] {
    [("queue", queue.to_string())]
}

/// Record job submitted.
pub fn record_job_submitted(queue: &QueueName) {
    counter!(names::JOBS_SUBMITTED_TOTAL, &queue_labels(queue)).increment(1);
}

/// Record job completed, with the duration of its last attempt.
pub fn record_job_completed(queue: &QueueName, duration_secs: f64) {
    let labels = queue_labels(queue);
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record job failed terminally.
pub fn record_job_failed(queue: &QueueName) {
    counter!(names::JOBS_FAILED_TOTAL, &queue_labels(queue)).increment(1);
}

/// Record a retry being scheduled.
pub fn record_job_retried(queue: &QueueName) {
    counter!(names::JOBS_RETRIED_TOTAL, &queue_labels(queue)).increment(1);
}

/// Record job cancelled.
pub fn record_job_cancelled(queue: &QueueName) {
    counter!(names::JOBS_CANCELLED_TOTAL, &queue_labels(queue)).increment(1);
}

/// Update queue depth gauge.
pub fn set_queue_depth(queue: &QueueName, depth: u64) {
    gauge!(names::QUEUE_DEPTH, &queue_labels(queue)).set(depth as f64);
}

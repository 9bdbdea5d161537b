//! Job workers and the queue service facade.
//!
//! This crate provides:
//! - Exponential backoff and backend retry helpers
//! - The work function registry and error classification
//! - The work runner (timeouts, panics, cancellation)
//! - Per-queue worker pools
//! - `QueueService`: submit, status, cancel, stats, graceful shutdown

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod service;

pub use config::{BackendErrorPolicy, QueueSettings, WorkerConfig};
pub use error::{ServiceError, ServiceResult, WorkError, WorkResult};
pub use logging::JobLogger;
pub use pool::WorkerPool;
pub use progress::ProgressReporter;
pub use registry::{
    work_fn, DefaultClassifier, ErrorClassifier, Retryability, WorkFunction, WorkRegistry,
};
pub use retry::BackoffPolicy;
pub use runner::{Verdict, WorkRunner};
pub use service::{
    AdmissionPolicy, AllowAll, QueueService, QueueServiceBuilder, QueueStats, SubmitRequest,
};

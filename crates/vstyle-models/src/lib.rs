//! Shared data models for the VStyle job queue.
//!
//! This crate provides Serde-serializable types for:
//! - Job and queue identifiers
//! - The job status state machine
//! - The job record returned to status callers

pub mod job;
pub mod job_status;

// Re-export common types
pub use job::{JobId, JobRecord, QueueName};
pub use job_status::JobStatus;

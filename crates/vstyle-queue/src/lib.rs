//! Job record store and queue backends.
//!
//! This crate provides:
//! - The synchronized `JobStore` holding canonical job state
//! - The `QueueBackend` trait
//! - A Redis backend (sorted sets, delayed retries, record snapshots)
//! - An in-process fallback backend
//! - One-time backend selection via a connectivity probe

pub mod backend;
pub mod durable;
pub mod error;
pub mod memory;
pub mod store;

pub use backend::{select_backend, BackendMode, QueueBackend};
pub use durable::{RedisBackend, RedisConfig};
pub use error::{QueueError, QueueResult};
pub use memory::MemoryBackend;
pub use store::{JobStore, StatusChange, StatusCounts};

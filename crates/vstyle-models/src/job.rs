//! Job definitions shared by the queue, the workers and status callers.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::JobStatus;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a queue, e.g. "analysis" or "render".
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct QueueName(pub String);

impl QueueName {
    pub const ANALYSIS: &'static str = "analysis";
    pub const RENDER: &'static str = "render";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The queue for video style analysis.
    pub fn analysis() -> Self {
        Self::new(Self::ANALYSIS)
    }

    /// The queue for styled renders.
    pub fn render() -> Self {
        Self::new(Self::RENDER)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn default_max_attempts() -> u32 {
    3
}

/// Canonical state of a submitted job.
///
/// This is what `get_status` hands back and what the durable backend
/// persists as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    /// Unique job ID
    pub id: JobId,

    /// Queue servicing this job
    pub queue: QueueName,

    /// Work function selector within the queue
    pub kind: String,

    /// Submitting identity, if the caller supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Opaque payload handed to the work function
    #[serde(default)]
    pub payload: Value,

    /// Job status
    #[serde(default)]
    pub status: JobStatus,

    /// Progress (0-100)
    #[serde(default)]
    pub progress: u8,

    /// Lower values are serviced first
    #[serde(default)]
    pub priority: i32,

    /// Execution attempts made so far
    #[serde(default)]
    pub attempt: u32,

    /// Maximum attempts allowed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Work function result (if completed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error message (if failed or cancelled)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Error of the most recent retryable failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// First dequeue timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Terminal transition timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a new queued job with a fresh ID.
    pub fn new(queue: impl Into<QueueName>, kind: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();

        Self {
            id: JobId::new(),
            queue: queue.into(),
            kind: kind.into(),
            owner: None,
            payload,
            status: JobStatus::Queued,
            progress: 0,
            priority: 0,
            attempt: 0,
            max_attempts: default_max_attempts(),
            result: None,
            error: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the attempt ceiling (at least one attempt is always made).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the submitting identity.
    pub fn with_owner(mut self, owner: Option<String>) -> Self {
        self.owner = owner;
        self
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if another attempt is allowed after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

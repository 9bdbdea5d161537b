//! Worker configuration.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use vstyle_models::QueueName;
use vstyle_queue::RedisConfig;

use crate::retry::BackoffPolicy;

/// What a worker slot does when the backend fails mid-run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendErrorPolicy {
    /// Log, wait `backend_retry_delay` and keep polling.
    #[default]
    Retry,
    /// Log and stop the slot.
    Halt,
}

impl FromStr for BackendErrorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "halt" => Ok(Self::Halt),
            other => Err(format!("unknown backend error policy: {}", other)),
        }
    }
}

/// Per-queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Concurrent worker slots
    pub workers: usize,
    /// Attempts a job on this queue gets unless it asks for its own
    pub max_attempts: u32,
    /// Delay schedule between retries
    pub backoff: BackoffPolicy,
}

impl QueueSettings {
    pub fn new(workers: usize, max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            workers,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Defaults for the analysis queue.
    pub fn analysis() -> Self {
        Self::new(
            2,
            3,
            BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
        )
    }

    /// Defaults for the render queue.
    pub fn render() -> Self {
        Self::new(
            1,
            2,
            BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(120)),
        )
    }

    /// Read `{PREFIX}_WORKERS`, `{PREFIX}_MAX_ATTEMPTS`,
    /// `{PREFIX}_BACKOFF_BASE_MS` and `{PREFIX}_BACKOFF_MAX_MS`, falling back
    /// to `defaults`.
    fn from_env(prefix: &str, defaults: Self) -> Self {
        Self::new(
            env_or(&format!("{}_WORKERS", prefix), defaults.workers),
            env_or(&format!("{}_MAX_ATTEMPTS", prefix), defaults.max_attempts),
            BackoffPolicy::new(
                Duration::from_millis(env_or(
                    &format!("{}_BACKOFF_BASE_MS", prefix),
                    defaults.backoff.base.as_millis() as u64,
                )),
                Duration::from_millis(env_or(
                    &format!("{}_BACKOFF_MAX_MS", prefix),
                    defaults.backoff.max.as_millis() as u64,
                )),
            ),
        )
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Durable backend; `None` forces the in-process queue
    pub redis: Option<RedisConfig>,
    /// Configured queues and their pool settings
    pub queues: BTreeMap<QueueName, QueueSettings>,
    /// Job timeout
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How long a slot blocks on one dequeue call
    pub poll_wait: Duration,
    /// Reaction to backend errors in a running slot
    pub backend_error_policy: BackendErrorPolicy,
    /// Pause between polls after a backend error
    pub backend_retry_delay: Duration,
    /// How long observed terminal records are kept
    pub record_retention: Duration,
    /// How often the janitor prunes records
    pub janitor_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(QueueName::analysis(), QueueSettings::analysis());
        queues.insert(QueueName::render(), QueueSettings::render());

        Self {
            redis: None,
            queues,
            job_timeout: Duration::from_secs(3600), // 1 hour
            shutdown_timeout: Duration::from_secs(30),
            poll_wait: Duration::from_secs(1),
            backend_error_policy: BackendErrorPolicy::Retry,
            backend_retry_delay: Duration::from_secs(1),
            record_retention: Duration::from_secs(3600),
            janitor_interval: Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let mut queues = BTreeMap::new();
        queues.insert(
            QueueName::analysis(),
            QueueSettings::from_env("ANALYSIS", QueueSettings::analysis()),
        );
        queues.insert(
            QueueName::render(),
            QueueSettings::from_env("RENDER", QueueSettings::render()),
        );

        Self {
            redis: RedisConfig::from_env(),
            queues,
            job_timeout: Duration::from_secs(env_or("WORKER_JOB_TIMEOUT", 3600)),
            shutdown_timeout: Duration::from_secs(env_or("WORKER_SHUTDOWN_TIMEOUT", 30)),
            poll_wait: Duration::from_millis(env_or("QUEUE_POLL_WAIT_MS", 1000)),
            backend_error_policy: env_or("QUEUE_BACKEND_ERROR_POLICY", BackendErrorPolicy::Retry),
            backend_retry_delay: Duration::from_millis(env_or("QUEUE_BACKEND_RETRY_DELAY_MS", 1000)),
            record_retention: Duration::from_secs(env_or("JOB_RECORD_RETENTION_SECS", 3600)),
            janitor_interval: Duration::from_secs(env_or("JOB_JANITOR_INTERVAL_SECS", 60)),
        }
    }

    /// Replace or add the settings for one queue.
    pub fn with_queue(mut self, queue: impl Into<QueueName>, settings: QueueSettings) -> Self {
        self.queues.insert(queue.into(), settings);
        self
    }

    /// Settings for `queue`, if it is configured.
    pub fn queue(&self, queue: &QueueName) -> Option<&QueueSettings> {
        self.queues.get(queue)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

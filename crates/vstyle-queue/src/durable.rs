//! Durable queue backend on Redis.
//!
//! Layout, for key prefix `p`:
//! - `p:queue:{name}`   sorted set, score = priority, member = `{seq:020}:{job_id}`
//! - `p:delayed:{name}` sorted set, score = ready-at unix millis, same members
//! - `p:job:{id}`       JSON `JobRecord` snapshot (no expiry)
//! - `p:members`        hash job_id -> current member, used to remove queued jobs
//! - `p:seq`            global submission counter
//!
//! Redis orders equal scores lexicographically, so the zero-padded sequence
//! makes equal-priority jobs come out in submission order.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::{debug, info};

use vstyle_models::{JobId, JobRecord, QueueName};

use crate::backend::{BackendMode, QueueBackend};
use crate::error::{QueueError, QueueResult};

/// Max delayed jobs promoted per dequeue call.
const PROMOTE_BATCH: usize = 100;

/// Redis backend configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key this backend writes
    pub key_prefix: String,
    /// How long the startup connectivity probe may take
    pub probe_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vstyle".to_string(),
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl RedisConfig {
    /// Create config from environment variables.
    ///
    /// Returns `None` when `REDIS_URL` is unset or empty, which forces the
    /// in-process fallback.
    pub fn from_env() -> Option<Self> {
        let redis_url = std::env::var("REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())?;

        Some(Self {
            redis_url,
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or_else(|_| "vstyle".to_string()),
            probe_timeout: Duration::from_millis(
                std::env::var("QUEUE_PROBE_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
            ),
        })
    }
}

fn encode_member(seq: u64, id: &JobId) -> String {
    format!("{:020}:{}", seq, id)
}

fn decode_member(member: &str) -> Option<JobId> {
    member
        .split_once(':')
        .map(|(_, id)| JobId::from_string(id))
}

/// Redis-backed queue shared by any number of worker processes.
pub struct RedisBackend {
    client: redis::Client,
    config: RedisConfig,
}

impl RedisBackend {
    /// Open a client and verify the server answers within the probe timeout.
    pub async fn connect(config: RedisConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let backend = Self { client, config };

        match tokio::time::timeout(backend.config.probe_timeout, backend.ping()).await {
            Ok(Ok(())) => {
                info!("Connected to Redis queue backend");
                Ok(backend)
            }
            Ok(Err(e)) => Err(QueueError::connection_failed(e.to_string())),
            Err(_) => Err(QueueError::connection_failed(format!(
                "no PING reply within {:?}",
                backend.config.probe_timeout
            ))),
        }
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn queue_key(&self, queue: &QueueName) -> String {
        format!("{}:queue:{}", self.config.key_prefix, queue)
    }

    fn delayed_key(&self, queue: &QueueName) -> String {
        format!("{}:delayed:{}", self.config.key_prefix, queue)
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, id)
    }

    fn members_key(&self) -> String {
        format!("{}:members", self.config.key_prefix)
    }

    fn seq_key(&self) -> String {
        format!("{}:seq", self.config.key_prefix)
    }

    async fn snapshot(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        id: &JobId,
    ) -> QueueResult<Option<JobRecord>> {
        let payload: Option<String> = conn.get(self.job_key(id)).await?;
        payload
            .map(|json| serde_json::from_str(&json).map_err(QueueError::from))
            .transpose()
    }

    /// Move due retries from the delayed set into the queue.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue: &QueueName,
    ) -> QueueResult<()> {
        let now_ms = Utc::now().timestamp_millis();
        let delayed_key = self.delayed_key(queue);

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(conn)
            .await?;

        for member in due {
            // Only the consumer that removes the member promotes it.
            let removed: i64 = redis::cmd("ZREM")
                .arg(&delayed_key)
                .arg(&member)
                .query_async(conn)
                .await?;
            if removed == 0 {
                continue;
            }

            let Some(id) = decode_member(&member) else {
                continue;
            };
            let Some(record) = self.snapshot(conn, &id).await? else {
                continue;
            };

            redis::cmd("ZADD")
                .arg(self.queue_key(queue))
                .arg(record.priority)
                .arg(&member)
                .query_async::<()>(conn)
                .await?;
            debug!(job_id = %id, queue = %queue, "Promoted delayed job");
        }

        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Durable
    }

    async fn enqueue(&self, record: &JobRecord) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let payload = serde_json::to_string(record)?;
        let seq: u64 = conn.incr(self.seq_key(), 1).await?;
        let member = encode_member(seq, &record.id);

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.job_key(&record.id))
            .arg(&payload)
            .ignore()
            .cmd("ZADD")
            .arg(self.queue_key(&record.queue))
            .arg(record.priority)
            .arg(&member)
            .ignore()
            .cmd("HSET")
            .arg(self.members_key())
            .arg(record.id.as_str())
            .arg(&member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        info!(
            job_id = %record.id,
            queue = %record.queue,
            priority = record.priority,
            "Enqueued job with member {}", member
        );
        Ok(())
    }

    async fn dequeue(&self, queue: &QueueName, wait: Duration) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        self.promote_due(&mut conn, queue).await?;

        // BZPOPMIN treats 0 as "block forever".
        let timeout_secs = wait.as_secs_f64().max(0.01);
        let popped: Option<(String, String, f64)> = redis::cmd("BZPOPMIN")
            .arg(self.queue_key(queue))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        let Some((_, member, _)) = popped else {
            return Ok(None);
        };
        let id = decode_member(&member)
            .ok_or_else(|| QueueError::dequeue_failed(format!("malformed queue member {}", member)))?;

        conn.hdel::<_, _, ()>(self.members_key(), id.as_str()).await?;

        match self.snapshot(&mut conn, &id).await? {
            Some(record) => {
                debug!(job_id = %id, queue = %queue, "Dequeued job from Redis");
                Ok(Some(record))
            }
            None => {
                debug!(job_id = %id, "Dropped queue member without a snapshot");
                Ok(None)
            }
        }
    }

    async fn ack(&self, id: &JobId) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let member: Option<String> = conn.hget(self.members_key(), id.as_str()).await?;
        if let Some(member) = member {
            if let Some(record) = self.snapshot(&mut conn, id).await? {
                redis::pipe()
                    .atomic()
                    .cmd("ZREM")
                    .arg(self.queue_key(&record.queue))
                    .arg(&member)
                    .ignore()
                    .cmd("ZREM")
                    .arg(self.delayed_key(&record.queue))
                    .arg(&member)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
            }
            conn.hdel::<_, _, ()>(self.members_key(), id.as_str()).await?;
        }

        debug!(job_id = %id, "Acknowledged job");
        Ok(())
    }

    async fn requeue_after(&self, id: &JobId, delay: Duration) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let record = self
            .snapshot(&mut conn, id)
            .await?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;

        let seq: u64 = conn.incr(self.seq_key(), 1).await?;
        let member = encode_member(seq, id);

        let (key, score) = if delay.is_zero() {
            (self.queue_key(&record.queue), i64::from(record.priority))
        } else {
            let ready_at = Utc::now().timestamp_millis()
                + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
            (self.delayed_key(&record.queue), ready_at)
        };

        redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(score)
            .arg(&member)
            .ignore()
            .cmd("HSET")
            .arg(self.members_key())
            .arg(id.as_str())
            .arg(&member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(job_id = %id, delay_ms = delay.as_millis() as u64, "Scheduled job retry");
        Ok(())
    }

    async fn len(&self, queue: &QueueName) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ready: u64 = conn.zcard(self.queue_key(queue)).await?;
        let delayed: u64 = conn.zcard(self.delayed_key(queue)).await?;
        Ok(ready + delayed)
    }

    async fn store_snapshot(&self, record: &JobRecord) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(self.job_key(&record.id), payload).await?;
        Ok(())
    }

    async fn load_snapshot(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        self.snapshot(&mut conn, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_order_follows_sequence() {
        let id = JobId::new();
        let early = encode_member(9, &id);
        let late = encode_member(10, &id);

        assert!(early < late);
        assert_eq!(decode_member(&late), Some(id));
    }

    #[test]
    fn test_decode_rejects_bare_member() {
        assert_eq!(decode_member("no-separator"), None);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let config = RedisConfig {
            redis_url: "redis://127.0.0.1:1".to_string(),
            probe_timeout: Duration::from_millis(300),
            ..Default::default()
        };

        let err = RedisBackend::connect(config).await.err();
        assert!(matches!(err, Some(QueueError::ConnectionFailed(_))));
    }

    #[test]
    fn test_from_env_requires_url() {
        std::env::remove_var("REDIS_URL");
        assert!(RedisConfig::from_env().is_none());
    }
}

//! Job broker abstraction and the Redis-backed queue.
//!
//! The [`JobBroker`] trait is the only thing intake and workers depend on.
//! Two implementations exist: [`JobQueue`] (Redis) and
//! [`InMemoryJobQueue`](super::memory::InMemoryJobQueue) (single process).
//!
//! # Queue Structure
//!
//! The Redis queue uses these keys:
//!
//! - `{queue_name}`: Main list where jobs are enqueued (LPUSH, consumed with BRPOPLPUSH)
//! - `{queue_name}:processing`: Jobs held by a worker (for crash recovery)
//! - `{queue_name}:delayed`: Sorted set of jobs waiting out a retry backoff, scored by due time
//! - `{queue_name}:dead_letter`: Jobs that failed after max attempts
//! - `{queue_name}:job:{id}`: Hash with the queue-level state and progress of a job
//!
//! # Reliability
//!
//! Jobs are atomically moved from the main queue to the processing list when
//! dequeued. If a worker crashes, jobs in the processing list are recovered
//! and requeued on the next pool start.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::job::Job;

/// How long queue-level job state is kept after the last update (7 days).
const STATE_TTL_SECS: i64 = 604_800;

/// Maximum number of due delayed jobs promoted per dequeue call.
const PROMOTE_BATCH: isize = 100;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The broker is closed or otherwise unable to accept work.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

/// Queue-level state of a job, distinct from its persisted status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    /// Waiting in the main queue.
    Waiting,
    /// Held by a worker.
    Active,
    /// Waiting out a retry backoff.
    Delayed,
    /// Acknowledged after a terminal outcome.
    Completed,
    /// Acknowledged after terminal failure.
    Failed,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueueState::Waiting => "waiting",
            QueueState::Active => "active",
            QueueState::Delayed => "delayed",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Answer to `getStatus(jobId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub state: QueueState,
    /// Pipeline progress, 0 to 100.
    pub progress: u8,
}

/// Returned by `enqueue`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub job_id: Uuid,
    pub queue_name: String,
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of jobs waiting to be processed.
    pub pending_jobs: usize,
    /// Number of jobs currently being processed.
    pub processing_jobs: usize,
    /// Number of jobs waiting out a retry backoff.
    pub delayed_jobs: usize,
    /// Number of jobs in the dead letter queue.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the total number of jobs in all queues.
    pub fn total_jobs(&self) -> usize {
        self.pending_jobs + self.processing_jobs + self.delayed_jobs + self.dead_letter_jobs
    }
}

/// A shared broker that hands jobs to workers.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Name used for keys, logs and metric labels.
    fn queue_name(&self) -> &str;

    /// Checks that the broker is reachable.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Appends a job to the tail of the queue.
    async fn enqueue(&self, job: Job) -> Result<QueueHandle, QueueError>;

    /// Takes the next job, waiting up to `timeout`. Due delayed jobs are
    /// promoted to the tail of the queue first.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError>;

    /// Releases a held job and re-enqueues it at the tail once `delay` has passed.
    async fn schedule_retry(&self, job: Job, delay: Duration) -> Result<(), QueueError>;

    /// Releases a held job after a terminal outcome.
    async fn complete(&self, job_id: Uuid, state: QueueState) -> Result<(), QueueError>;

    /// Releases a held job into the dead letter queue.
    async fn dead_letter(&self, job: Job, error: &str) -> Result<(), QueueError>;

    /// Drops one held copy of a job without changing its queue state.
    async fn discard(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Records pipeline progress for a held job.
    async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<(), QueueError>;

    /// Queue-level status of a job, if the broker knows it.
    async fn status(&self, job_id: Uuid) -> Result<Option<QueueStatus>, QueueError>;

    /// Moves jobs left in the processing list by crashed workers back to the queue.
    async fn recover_processing_jobs(&self) -> Result<usize, QueueError>;

    /// Returns queue statistics.
    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

/// Redis-based job queue with reliable dequeue.
///
/// The queue uses BRPOPLPUSH for atomic dequeue operations, ensuring that
/// jobs are not lost if a worker crashes during processing.
pub struct JobQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Name of the main queue.
    queue_name: String,
    /// Name of the processing queue.
    processing_queue: String,
    /// Name of the delayed sorted set.
    delayed_queue: String,
    /// Name of the dead letter queue.
    dead_letter_queue: String,
}

impl JobQueue {
    /// Connects to Redis and creates a new job queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a JobQueue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            delayed_queue: format!("{}:delayed", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
        }
    }

    fn job_key(&self, job_id: Uuid) -> String {
        format!("{}:job:{}", self.queue_name, job_id)
    }

    async fn write_state(
        &self,
        job_id: Uuid,
        state: QueueState,
        progress: Option<u8>,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let key = self.job_key(job_id);
        let state = state.to_string();

        let mut pipe = redis::pipe();
        pipe.atomic().hset(&key, "state", state.as_str());
        if let Some(progress) = progress {
            pipe.hset(&key, "progress", progress);
        }
        pipe.expire(&key, STATE_TTL_SECS);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Moves due jobs from the delayed set to the tail of the main queue.
    ///
    /// ZREM decides ownership, so concurrent workers never push the same
    /// delayed entry twice.
    async fn promote_due_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let now_ms = Utc::now().timestamp_millis();

        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_queue)
            .arg("-inf")
            .arg(now_ms)
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query_async(&mut conn)
            .await?;

        let mut promoted = 0;
        for entry in due {
            let removed: i64 = conn.zrem(&self.delayed_queue, &entry).await?;
            if removed == 1 {
                conn.lpush::<_, _, ()>(&self.queue_name, &entry).await?;
                if let Ok(job) = serde_json::from_str::<Job>(&entry) {
                    self.write_state(job.id, QueueState::Waiting, None).await?;
                }
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Helper to remove a job from the processing queue by ID.
    async fn remove_job_from_processing(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for job_data in jobs {
            if let Ok(job) = serde_json::from_str::<Job>(&job_data) {
                if job.id == job_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &job_data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Job not found is not an error - it might have been already removed
        Ok(())
    }

    /// Peeks at jobs in the dead letter queue without removing them.
    pub async fn peek_dead_letter(
        &self,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(&self.dead_letter_queue, 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }
}

#[async_trait]
impl JobBroker for JobQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<QueueHandle, QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        let key = self.job_key(job.id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(&self.queue_name, serialized)
            .hset(&key, "state", QueueState::Waiting.to_string())
            .hset(&key, "progress", 0u8)
            .expire(&key, STATE_TTL_SECS);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(QueueHandle {
            job_id: job.id,
            queue_name: self.queue_name.clone(),
        })
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        self.promote_due_jobs().await?;

        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        // BRPOPLPUSH atomically pops from source and pushes to destination
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let job: Job = serde_json::from_str(&data)?;
                self.write_state(job.id, QueueState::Active, Some(0)).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn schedule_retry(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        self.remove_job_from_processing(job.id).await?;

        let mut conn = self.redis.clone();
        let due_ms = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let serialized = serde_json::to_string(&job)?;
        conn.zadd::<_, _, _, ()>(&self.delayed_queue, serialized, due_ms)
            .await?;

        self.write_state(job.id, QueueState::Delayed, Some(0)).await
    }

    async fn complete(&self, job_id: Uuid, state: QueueState) -> Result<(), QueueError> {
        self.remove_job_from_processing(job_id).await?;
        self.write_state(job_id, state, Some(100)).await
    }

    async fn dead_letter(&self, job: Job, error: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        self.remove_job_from_processing(job.id).await?;

        let dead_letter_entry = serde_json::json!({
            "job": job,
            "error": error,
            "moved_at": Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&dead_letter_entry)?;

        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;

        self.write_state(job.id, QueueState::Failed, Some(100)).await
    }

    async fn discard(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.remove_job_from_processing(job_id).await
    }

    async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<(), QueueError> {
        self.write_state(job_id, QueueState::Active, Some(progress.min(100)))
            .await
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<QueueStatus>, QueueError> {
        let mut conn = self.redis.clone();
        let key = self.job_key(job_id);

        let (state, progress): (Option<String>, Option<u8>) = redis::pipe()
            .hget(&key, "state")
            .hget(&key, "progress")
            .query_async(&mut conn)
            .await?;

        let Some(state) = state else {
            return Ok(None);
        };

        let state: QueueState = serde_json::from_value(serde_json::Value::String(state))?;
        Ok(Some(QueueStatus {
            state,
            progress: progress.unwrap_or(0),
        }))
    }

    /// Recovers jobs stuck in the processing queue.
    ///
    /// This should be called on worker startup to recover jobs from
    /// workers that crashed. The crashed attempt counts as consumed.
    async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let jobs: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for job_data in jobs {
            if let Ok(mut job) = serde_json::from_str::<Job>(&job_data) {
                job.increment_attempts();

                if job.should_retry() {
                    let serialized = serde_json::to_string(&job)?;

                    // Use a transaction to atomically remove from processing and add to main
                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .lrem(&self.processing_queue, 1, &job_data)
                        .lpush(&self.queue_name, &serialized);
                    pipe.query_async::<_, ()>(&mut conn).await?;
                    self.write_state(job.id, QueueState::Waiting, Some(0))
                        .await?;

                    recovered += 1;
                } else {
                    self.dead_letter(job, "Recovered from processing queue after max attempts")
                        .await?;
                }
            }
        }

        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();

        let (pending, processing, delayed, dead): (usize, usize, usize, usize) = redis::pipe()
            .llen(&self.queue_name)
            .llen(&self.processing_queue)
            .zcard(&self.delayed_queue)
            .llen(&self.dead_letter_queue)
            .query_async(&mut conn)
            .await?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs: pending,
            processing_jobs: processing,
            delayed_jobs: delayed,
            dead_letter_jobs: dead,
        })
    }
}

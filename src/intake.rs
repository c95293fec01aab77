//! Submission intake.
//!
//! Validates a batch of repository URLs, records the submission and its
//! pending jobs, and enqueues one job per URL. If the broker rejects any
//! job the whole submission is discarded so no record is left behind that
//! nothing will ever process.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::PersistenceError;
use crate::scheduler::{Job, JobBroker, QueueError, QueueHandle};
use crate::storage::{JobStore, Submission};

/// Most repositories accepted in one submission.
pub const MAX_REPOS_PER_SUBMISSION: usize = 10;

/// Errors returned by [`Intake::submit`].
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Invalid submission: {0}")]
    Invalid(String),

    #[error("Job queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Failed to record submission: {0}")]
    Persistence(#[from] PersistenceError),
}

/// A recorded submission with the broker handles of its jobs.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub submission: Submission,
    pub handles: Vec<QueueHandle>,
}

/// Entry point for new verification requests.
pub struct Intake {
    broker: Arc<dyn JobBroker>,
    store: Arc<dyn JobStore>,
    max_attempts: u32,
}

impl Intake {
    pub fn new(broker: Arc<dyn JobBroker>, store: Arc<dyn JobStore>, max_attempts: u32) -> Self {
        Self {
            broker,
            store,
            max_attempts,
        }
    }

    /// Records and enqueues one job per URL.
    ///
    /// # Errors
    ///
    /// - `Invalid` for an empty batch, more than
    ///   [`MAX_REPOS_PER_SUBMISSION`] URLs, or a blank URL
    /// - `Queue` if the broker is unreachable or rejects a job
    /// - `Persistence` if the submission cannot be written
    pub async fn submit(&self, repo_urls: &[String]) -> Result<Accepted, IntakeError> {
        let urls = validate_urls(repo_urls)?;

        // Nothing is written while the broker is down.
        self.broker.ping().await?;

        let (submission, records) = self
            .store
            .create_submission(&urls, self.max_attempts)
            .await?;

        let mut handles = Vec::with_capacity(records.len());
        for record in &records {
            let job = Job::new(record.id, record.repo_url.clone(), submission.id)
                .with_max_attempts(record.max_attempts);
            match self.broker.enqueue(job).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(
                        submission_id = %submission.id,
                        job_id = %record.id,
                        error = %e,
                        "Enqueue failed, discarding submission"
                    );
                    if let Err(discard_err) = self.store.discard_submission(submission.id).await {
                        error!(
                            submission_id = %submission.id,
                            error = %discard_err,
                            "Failed to discard submission after enqueue failure"
                        );
                    }
                    return Err(IntakeError::Queue(e));
                }
            }
        }

        info!(
            submission_id = %submission.id,
            jobs = handles.len(),
            "Submission accepted"
        );
        Ok(Accepted {
            submission,
            handles,
        })
    }
}

fn validate_urls(repo_urls: &[String]) -> Result<Vec<String>, IntakeError> {
    if repo_urls.is_empty() {
        return Err(IntakeError::Invalid(
            "at least one repository URL is required".to_string(),
        ));
    }
    if repo_urls.len() > MAX_REPOS_PER_SUBMISSION {
        return Err(IntakeError::Invalid(format!(
            "at most {} repository URLs per submission, got {}",
            MAX_REPOS_PER_SUBMISSION,
            repo_urls.len()
        )));
    }

    repo_urls
        .iter()
        .map(|url| {
            let url = url.trim();
            if url.is_empty() {
                Err(IntakeError::Invalid("repository URL cannot be empty".to_string()))
            } else {
                Ok(url.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{InMemoryJobQueue, JobStatus, QueueState, QueueStats, QueueStatus};
    use crate::storage::InMemoryJobStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Accepts the first `accept` enqueues, then refuses.
    struct FlakyBroker {
        inner: InMemoryJobQueue,
        accept: usize,
        enqueued: AtomicUsize,
    }

    #[async_trait]
    impl JobBroker for FlakyBroker {
        fn queue_name(&self) -> &str {
            self.inner.queue_name()
        }

        async fn ping(&self) -> Result<(), QueueError> {
            self.inner.ping().await
        }

        async fn enqueue(&self, job: Job) -> Result<QueueHandle, QueueError> {
            if self.enqueued.fetch_add(1, Ordering::SeqCst) >= self.accept {
                return Err(QueueError::Unavailable("connection reset".to_string()));
            }
            self.inner.enqueue(job).await
        }

        async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
            self.inner.dequeue(timeout).await
        }

        async fn schedule_retry(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
            self.inner.schedule_retry(job, delay).await
        }

        async fn complete(&self, job_id: Uuid, state: QueueState) -> Result<(), QueueError> {
            self.inner.complete(job_id, state).await
        }

        async fn dead_letter(&self, job: Job, error: &str) -> Result<(), QueueError> {
            self.inner.dead_letter(job, error).await
        }

        async fn discard(&self, job_id: Uuid) -> Result<(), QueueError> {
            self.inner.discard(job_id).await
        }

        async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<(), QueueError> {
            self.inner.set_progress(job_id, progress).await
        }

        async fn status(&self, job_id: Uuid) -> Result<Option<QueueStatus>, QueueError> {
            self.inner.status(job_id).await
        }

        async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
            self.inner.recover_processing_jobs().await
        }

        async fn stats(&self) -> Result<QueueStats, QueueError> {
            self.inner.stats().await
        }
    }

    fn urls(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| format!("https://example.com/repo-{}.git", i))
            .collect()
    }

    #[tokio::test]
    async fn test_submit_creates_pending_jobs_and_enqueues() {
        let broker = Arc::new(InMemoryJobQueue::new("intake"));
        let store = Arc::new(InMemoryJobStore::new());
        let intake = Intake::new(broker.clone(), store.clone(), 3);

        let accepted = intake.submit(&urls(2)).await.expect("submit");
        assert_eq!(accepted.submission.total_repos, 2);
        assert_eq!(accepted.handles.len(), 2);

        let jobs = store
            .list_jobs(accepted.submission.id)
            .await
            .expect("list");
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert!(jobs.iter().all(|j| j.result.is_none() && j.max_attempts == 3));

        let stats = broker.stats().await.expect("stats");
        assert_eq!(stats.pending_jobs, 2);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_batches() {
        let broker = Arc::new(InMemoryJobQueue::new("intake"));
        let store = Arc::new(InMemoryJobStore::new());
        let intake = Intake::new(broker, store, 3);

        let err = intake.submit(&[]).await.expect_err("empty");
        assert!(matches!(err, IntakeError::Invalid(_)));

        let err = intake.submit(&urls(11)).await.expect_err("too many");
        assert!(err.to_string().contains("at most 10"));

        let err = intake
            .submit(&["  ".to_string()])
            .await
            .expect_err("blank");
        assert!(matches!(err, IntakeError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_submit_fails_fast_when_broker_down() {
        let broker = Arc::new(InMemoryJobQueue::new("intake"));
        broker.close();
        let store = Arc::new(InMemoryJobStore::new());
        let intake = Intake::new(broker, store.clone(), 3);

        let err = intake.submit(&urls(1)).await.expect_err("down");
        assert!(matches!(err, IntakeError::Queue(_)));
        assert_eq!(store.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_failure_discards_submission() {
        let broker = Arc::new(FlakyBroker {
            inner: InMemoryJobQueue::new("intake"),
            accept: 1,
            enqueued: AtomicUsize::new(0),
        });
        let store = Arc::new(InMemoryJobStore::new());
        let intake = Intake::new(broker, store.clone(), 3);

        let err = intake.submit(&urls(3)).await.expect_err("enqueue fails");
        assert!(matches!(err, IntakeError::Queue(_)));
        assert_eq!(store.submission_count(), 0);
    }
}

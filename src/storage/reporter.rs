//! Result reporter.
//!
//! Sits between workers and the [`JobStore`]. Every write is retried with
//! capped backoff while the store reports a transient error, so a computed
//! result is never dropped on the floor. Also owns reconciliation of stale
//! `processing` rows, shared by workers and the watchdog.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::store::{JobRecord, JobStore};
use crate::error::PersistenceError;
use crate::scheduler::job::{Job, JobOutcome, JobStatus};

/// Reason written when a stuck attempt is reclaimed.
pub const ABANDONED_REASON: &str = "timeout";

/// Backoff for store writes.
#[derive(Debug, Clone)]
pub struct PersistRetry {
    /// Total tries per write, including the first.
    pub max_tries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for PersistRetry {
    fn default() -> Self {
        Self {
            max_tries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// What a worker should do with a dequeued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The job is now `processing` under this attempt number.
    Claimed { attempts: u32 },
    /// The job already reached a terminal state; drop the message.
    AlreadyTerminal,
    /// Another live worker holds the job; drop this copy.
    HeldElsewhere,
    /// No record exists for the job.
    Missing,
}

/// Writes attempt outcomes to the store.
#[derive(Clone)]
pub struct ResultReporter {
    store: Arc<dyn JobStore>,
    retry: PersistRetry,
}

impl ResultReporter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            retry: PersistRetry::default(),
        }
    }

    pub fn with_retry(mut self, retry: PersistRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn persist<T, F, Fut>(&self, what: &str, job_id: Uuid, mut op: F) -> Result<T, PersistenceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PersistenceError>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tries < self.retry.max_tries => {
                    let delay = self
                        .retry
                        .base_delay
                        .checked_mul(1 << (tries - 1).min(16))
                        .unwrap_or(self.retry.max_delay)
                        .min(self.retry.max_delay);
                    warn!(
                        job_id = %job_id,
                        operation = what,
                        attempt = tries,
                        error = %e,
                        "Store write failed, retrying in {:?}",
                        delay
                    );
                    crate::metrics::record_persistence_retry();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `update_job_status` with retries.
    pub async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        attempts: u32,
    ) -> Result<(), PersistenceError> {
        self.persist("update_job_status", job_id, || {
            self.store.update_job_status(job_id, status, attempts)
        })
        .await
    }

    /// Writes one attempt outcome.
    pub async fn report(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<(), PersistenceError> {
        self.persist("update_job_result", job_id, || {
            self.store.update_job_result(job_id, outcome)
        })
        .await?;
        debug!(
            job_id = %job_id,
            status = %outcome.status,
            result = ?outcome.result,
            attempts = outcome.attempts,
            "Recorded attempt outcome"
        );
        Ok(())
    }

    /// Writes one attempt outcome, retrying transient failures until it is
    /// stored or `stop` fires.
    ///
    /// Returns the last transient error only when stopped. Errors the store
    /// rejects outright are returned at once.
    pub async fn report_until_stored(
        &self,
        job_id: Uuid,
        outcome: &JobOutcome,
        stop: &CancellationToken,
    ) -> Result<(), PersistenceError> {
        let mut rounds: u32 = 0;
        loop {
            match self.report(job_id, outcome).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    rounds += 1;
                    error!(
                        job_id = %job_id,
                        rounds = rounds,
                        status = %outcome.status,
                        result = ?outcome.result,
                        error = %e,
                        "Store still unavailable, holding attempt outcome"
                    );
                    tokio::select! {
                        _ = stop.cancelled() => return Err(e),
                        _ = tokio::time::sleep(self.retry.max_delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves a dequeued job into `processing` for the attempt it is about to run.
    ///
    /// `job.attempts` must already count this attempt. A row still in
    /// `processing` and older than `stale_after` belongs to a worker that
    /// stopped without reporting; it is reclaimed first.
    pub async fn begin_attempt(
        &self,
        job: &Job,
        stale_after: Duration,
    ) -> Result<Claim, PersistenceError> {
        let record = self
            .persist("get_job", job.id, || self.store.get_job(job.id))
            .await?;
        let Some(record) = record else {
            return Ok(Claim::Missing);
        };

        if record.is_terminal() {
            return Ok(Claim::AlreadyTerminal);
        }

        match record.status {
            JobStatus::Processing => {
                let stale_after = chrono::Duration::from_std(stale_after)
                    .unwrap_or_else(|_| chrono::Duration::days(365));
                let stale_before = Utc::now() - stale_after;
                if record.updated_at > stale_before {
                    return Ok(Claim::HeldElsewhere);
                }
                if self.reclaim(&record).await?.is_none() {
                    return Ok(Claim::AlreadyTerminal);
                }
            }
            JobStatus::Failed => {
                // A previous attempt wrote its failure but never took the retry edge.
                self.update_status(job.id, JobStatus::Pending, record.attempts)
                    .await?;
            }
            JobStatus::Pending | JobStatus::Completed => {}
        }

        // The row is the authority; a recovered message may over- or under-count.
        let attempts = job
            .attempts
            .max(record.attempts + 1)
            .min(record.max_attempts);
        self.update_status(job.id, JobStatus::Processing, attempts)
            .await?;
        Ok(Claim::Claimed { attempts })
    }

    /// Resolves a `processing` row whose worker went silent.
    ///
    /// Takes the retry edge when attempts remain and returns the attempt
    /// count to re-enqueue with. Otherwise fails the job terminally with no
    /// result and returns `None`.
    pub async fn reclaim(&self, record: &JobRecord) -> Result<Option<u32>, PersistenceError> {
        let logs = format!(
            "{}\nAttempt {} abandoned: no result within the deadline\n",
            record.logs.trim_end(),
            record.attempts
        );

        if record.attempts < record.max_attempts {
            let outcome =
                JobOutcome::retryable_failure(ABANDONED_REASON, logs, None, record.attempts);
            self.report(record.id, &outcome).await?;
            self.update_status(record.id, JobStatus::Pending, record.attempts)
                .await?;
            Ok(Some(record.attempts))
        } else {
            let mut outcome = JobOutcome::abandoned(ABANDONED_REASON, record.attempts);
            outcome.logs = logs;
            self.report(record.id, &outcome).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::InMemoryJobStore;

    async fn setup(max_attempts: u32) -> (Arc<InMemoryJobStore>, ResultReporter, Job) {
        let store = Arc::new(InMemoryJobStore::new());
        let (submission, records) = store
            .create_submission(&["https://example.com/r.git".to_string()], max_attempts)
            .await
            .expect("create");
        let record = &records[0];
        let job = Job::new(record.id, record.repo_url.clone(), submission.id)
            .with_max_attempts(max_attempts);

        let reporter = ResultReporter::new(store.clone()).with_retry(PersistRetry {
            max_tries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        });
        (store, reporter, job)
    }

    #[tokio::test]
    async fn test_begin_attempt_claims_pending_job() {
        let (store, reporter, mut job) = setup(3).await;
        job.increment_attempts();

        let claim = reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("claim");
        assert_eq!(claim, Claim::Claimed { attempts: 1 });

        let record = store.get_job(job.id).await.expect("get").expect("exists");
        assert_eq!(record.status, JobStatus::Processing);
        assert_eq!(record.attempts, 1);
    }

    #[tokio::test]
    async fn test_begin_attempt_skips_live_duplicate() {
        let (_store, reporter, mut job) = setup(3).await;
        job.increment_attempts();
        reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("first claim");

        let claim = reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("second claim");
        assert_eq!(claim, Claim::HeldElsewhere);
    }

    #[tokio::test]
    async fn test_begin_attempt_reclaims_stale_row() {
        let (store, reporter, mut job) = setup(3).await;
        job.increment_attempts();
        reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("first claim");
        store.backdate(job.id, Utc::now() - chrono::Duration::minutes(30));

        let claim = reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("reclaim");
        assert_eq!(claim, Claim::Claimed { attempts: 2 });
        assert_eq!(
            store.history(job.id),
            vec![
                JobStatus::Pending,
                JobStatus::Processing,
                JobStatus::Failed,
                JobStatus::Pending,
                JobStatus::Processing,
            ]
        );
    }

    #[tokio::test]
    async fn test_reclaim_without_attempts_left_keeps_result_null() {
        let (store, reporter, mut job) = setup(1).await;
        job.increment_attempts();
        reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("claim");

        let record = store.get_job(job.id).await.expect("get").expect("exists");
        let next = reporter.reclaim(&record).await.expect("reclaim");
        assert!(next.is_none());

        let record = store.get_job(job.id).await.expect("get").expect("exists");
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.result.is_none());
        assert!(record.is_terminal());
        assert_eq!(record.reason.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_report_retries_transient_failures() {
        let (store, reporter, mut job) = setup(3).await;
        job.increment_attempts();
        reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("claim");

        store.fail_next_writes(2);
        let outcome = JobOutcome::completed(
            true,
            "Setup completed successfully",
            "",
            None,
            Duration::from_secs(1),
            1,
        );
        reporter.report(job.id, &outcome).await.expect("report");
        assert_eq!(store.result_writes(job.id), 1);
    }

    #[tokio::test]
    async fn test_report_until_stored_outlasts_long_outage() {
        let (store, reporter, mut job) = setup(3).await;
        job.increment_attempts();
        reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("claim");

        store.fail_next_writes(8);
        let outcome = JobOutcome::completed(
            true,
            "Setup completed successfully",
            "",
            None,
            Duration::from_secs(1),
            1,
        );
        reporter
            .report_until_stored(job.id, &outcome, &CancellationToken::new())
            .await
            .expect("stored once the store recovers");

        let record = store.get_job(job.id).await.expect("get").expect("exists");
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.result, Some(true));
        assert_eq!(store.result_writes(job.id), 1);
    }

    #[tokio::test]
    async fn test_report_until_stored_stops_on_cancel() {
        let (store, reporter, mut job) = setup(3).await;
        job.increment_attempts();
        reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("claim");

        store.fail_next_writes(usize::MAX);
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let outcome = JobOutcome::retryable_failure("timeout", "", None, 1);
        let err = reporter
            .report_until_stored(job.id, &outcome, &stop)
            .await
            .expect_err("stopped while the store is down");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_report_gives_up_after_max_tries() {
        let (store, reporter, mut job) = setup(3).await;
        job.increment_attempts();
        reporter
            .begin_attempt(&job, Duration::from_secs(60))
            .await
            .expect("claim");

        store.fail_next_writes(10);
        let outcome = JobOutcome::retryable_failure("timeout", "", None, 1);
        let err = reporter
            .report(job.id, &outcome)
            .await
            .expect_err("store stays down");
        assert!(err.is_transient());
    }
}

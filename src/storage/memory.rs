//! In-memory job store.
//!
//! Enforces the same state machine as the PostgreSQL store and keeps the
//! full status history of every job, which tests use to check monotonicity.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::{check_transition, JobRecord, JobStore, Submission, SubmissionStatus};
use crate::error::PersistenceError;
use crate::scheduler::job::{JobOutcome, JobStatus};

#[derive(Default)]
struct Tables {
    submissions: HashMap<Uuid, Submission>,
    jobs: HashMap<Uuid, JobRecord>,
    history: HashMap<Uuid, Vec<JobStatus>>,
    result_writes: HashMap<Uuid, usize>,
    unavailable_writes: usize,
    unavailable_result_writes: usize,
}

/// A [`JobStore`] held in process memory.
#[derive(Default)]
pub struct InMemoryJobStore {
    tables: Mutex<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every status a job has been in, oldest first.
    pub fn history(&self, job_id: Uuid) -> Vec<JobStatus> {
        self.lock().history.get(&job_id).cloned().unwrap_or_default()
    }

    /// Number of `update_job_result` writes accepted for a job.
    pub fn result_writes(&self, job_id: Uuid) -> usize {
        self.lock().result_writes.get(&job_id).copied().unwrap_or(0)
    }

    /// Number of submissions currently stored.
    pub fn submission_count(&self) -> usize {
        self.lock().submissions.len()
    }

    /// Makes the next `count` writes fail with [`PersistenceError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().unavailable_writes = count;
    }

    /// Makes the next `count` result writes fail while other writes succeed.
    pub fn fail_next_result_writes(&self, count: usize) {
        self.lock().unavailable_result_writes = count;
    }

    /// Backdates a job's `updated_at`, as if its worker had gone silent.
    pub fn backdate(&self, job_id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.updated_at = updated_at;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Tables {
    fn take_write_failure(&mut self) -> Result<(), PersistenceError> {
        if self.unavailable_writes > 0 {
            self.unavailable_writes -= 1;
            return Err(PersistenceError::Unavailable(
                "simulated store outage".to_string(),
            ));
        }
        Ok(())
    }

    fn take_result_write_failure(&mut self) -> Result<(), PersistenceError> {
        if self.unavailable_result_writes > 0 {
            self.unavailable_result_writes -= 1;
            return Err(PersistenceError::Unavailable(
                "simulated store outage".to_string(),
            ));
        }
        self.take_write_failure()
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut JobRecord, PersistenceError> {
        self.jobs
            .get_mut(&job_id)
            .ok_or(PersistenceError::JobNotFound(job_id))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_submission(
        &self,
        repo_urls: &[String],
        max_attempts: u32,
    ) -> Result<(Submission, Vec<JobRecord>), PersistenceError> {
        let mut tables = self.lock();
        tables.take_write_failure()?;

        let now = Utc::now();
        let submission = Submission {
            id: Uuid::new_v4(),
            total_repos: repo_urls.len() as u32,
            processed_repos: 0,
            status: SubmissionStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        let jobs: Vec<JobRecord> = repo_urls
            .iter()
            .map(|url| JobRecord::new(submission.id, url.clone(), max_attempts))
            .collect();

        tables.submissions.insert(submission.id, submission.clone());
        for job in &jobs {
            tables.history.insert(job.id, vec![JobStatus::Pending]);
            tables.jobs.insert(job.id, job.clone());
        }

        Ok((submission, jobs))
    }

    async fn discard_submission(&self, submission_id: Uuid) -> Result<(), PersistenceError> {
        let mut tables = self.lock();
        tables.submissions.remove(&submission_id);

        let job_ids: Vec<Uuid> = tables
            .jobs
            .values()
            .filter(|j| j.submission_id == submission_id)
            .map(|j| j.id)
            .collect();
        for id in job_ids {
            tables.jobs.remove(&id);
            tables.history.remove(&id);
        }
        Ok(())
    }

    async fn get_submission(
        &self,
        submission_id: Uuid,
    ) -> Result<Option<Submission>, PersistenceError> {
        Ok(self.lock().submissions.get(&submission_id).cloned())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, PersistenceError> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn list_jobs(&self, submission_id: Uuid) -> Result<Vec<JobRecord>, PersistenceError> {
        let mut jobs: Vec<JobRecord> = self
            .lock()
            .jobs
            .values()
            .filter(|j| j.submission_id == submission_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        attempts: u32,
    ) -> Result<(), PersistenceError> {
        let mut tables = self.lock();
        tables.take_write_failure()?;

        let job = tables.job_mut(job_id)?;
        check_transition(job, status, attempts)?;
        job.status = status;
        job.attempts = attempts;
        job.updated_at = Utc::now();

        tables.history.entry(job_id).or_default().push(status);
        Ok(())
    }

    async fn update_job_result(
        &self,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<(), PersistenceError> {
        let mut tables = self.lock();
        tables.take_result_write_failure()?;

        let job = tables.job_mut(job_id)?;
        check_transition(job, outcome.status, outcome.attempts)?;
        let submission_id = job.submission_id;
        if outcome.is_terminal() && !tables.submissions.contains_key(&submission_id) {
            return Err(PersistenceError::SubmissionNotFound(submission_id));
        }

        tables.job_mut(job_id)?.apply(outcome);
        if outcome.is_terminal() {
            if let Some(submission) = tables.submissions.get_mut(&submission_id) {
                submission.processed_repos += 1;
                if submission.processed_repos >= submission.total_repos {
                    submission.status = SubmissionStatus::Completed;
                }
                submission.updated_at = Utc::now();
            }
        }

        tables
            .history
            .entry(job_id)
            .or_default()
            .push(outcome.status);
        *tables.result_writes.entry(job_id).or_default() += 1;
        Ok(())
    }

    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, PersistenceError> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < older_than)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn store_with_job(max_attempts: u32) -> (InMemoryJobStore, JobRecord) {
        let store = InMemoryJobStore::new();
        let (_, jobs) = store
            .create_submission(&["https://example.com/r.git".to_string()], max_attempts)
            .await
            .expect("create");
        let job = jobs.into_iter().next().expect("one job");
        (store, job)
    }

    #[tokio::test]
    async fn test_create_submission() {
        let store = InMemoryJobStore::new();
        let urls = vec![
            "https://example.com/a.git".to_string(),
            "https://example.com/b.git".to_string(),
        ];
        let (submission, jobs) = store.create_submission(&urls, 3).await.expect("create");

        assert_eq!(submission.total_repos, 2);
        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert_eq!(
            store.list_jobs(submission.id).await.expect("list").len(),
            2
        );
    }

    #[tokio::test]
    async fn test_terminal_result_completes_submission() {
        let (store, job) = store_with_job(3).await;

        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("processing");
        store
            .update_job_result(
                job.id,
                &JobOutcome::completed(
                    true,
                    "Setup completed successfully",
                    "",
                    None,
                    Duration::from_secs(1),
                    1,
                ),
            )
            .await
            .expect("result");

        let submission = store
            .get_submission(job.submission_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(submission.processed_repos, 1);
        assert_eq!(submission.status, SubmissionStatus::Completed);
        assert_eq!(
            store.history(job.id),
            vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Completed]
        );
    }

    #[tokio::test]
    async fn test_retryable_result_leaves_submission_pending() {
        let (store, job) = store_with_job(3).await;

        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("processing");
        store
            .update_job_result(job.id, &JobOutcome::retryable_failure("clone failed", "", None, 1))
            .await
            .expect("result");
        store
            .update_job_status(job.id, JobStatus::Pending, 1)
            .await
            .expect("retry edge");

        let submission = store
            .get_submission(job.submission_id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(submission.processed_repos, 0);
        assert_eq!(submission.status, SubmissionStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_edge_rejected_when_exhausted() {
        let (store, job) = store_with_job(1).await;

        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("processing");
        store
            .update_job_result(job.id, &JobOutcome::retryable_failure("timeout", "", None, 1))
            .await
            .expect("result");

        let err = store
            .update_job_status(job.id, JobStatus::Pending, 1)
            .await
            .expect_err("no attempts left");
        assert!(matches!(err, PersistenceError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_completed_job_cannot_regress() {
        let (store, job) = store_with_job(3).await;
        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("processing");
        store
            .update_job_result(
                job.id,
                &JobOutcome::completed(false, "Setup failed with exit code 1", "", None, Duration::ZERO, 1),
            )
            .await
            .expect("result");

        assert!(store
            .update_job_status(job.id, JobStatus::Processing, 2)
            .await
            .is_err());
        assert!(store
            .update_job_status(job.id, JobStatus::Pending, 1)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_simulated_outage() {
        let (store, job) = store_with_job(3).await;
        store.fail_next_writes(1);

        let err = store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect_err("outage");
        assert!(err.is_transient());

        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("recovered");
    }

    #[tokio::test]
    async fn test_missing_submission_leaves_job_untouched() {
        let (store, job) = store_with_job(3).await;
        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("processing");
        store.lock().submissions.remove(&job.submission_id);

        let err = store
            .update_job_result(
                job.id,
                &JobOutcome::completed(true, "Setup completed successfully", "", None, Duration::ZERO, 1),
            )
            .await
            .expect_err("submission missing");
        assert!(matches!(err, PersistenceError::SubmissionNotFound(_)));

        let record = store.get_job(job.id).await.expect("get").expect("exists");
        assert_eq!(record.status, JobStatus::Processing);
        assert!(record.result.is_none());
        assert_eq!(store.result_writes(job.id), 0);
        assert_eq!(
            store.history(job.id),
            vec![JobStatus::Pending, JobStatus::Processing]
        );
    }

    #[tokio::test]
    async fn test_result_outage_spares_status_writes() {
        let (store, job) = store_with_job(3).await;
        store.fail_next_result_writes(1);

        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("status writes unaffected");
        let err = store
            .update_job_result(job.id, &JobOutcome::retryable_failure("clone failed", "", None, 1))
            .await
            .expect_err("result outage");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_find_stale_processing() {
        let (store, job) = store_with_job(3).await;
        store
            .update_job_status(job.id, JobStatus::Processing, 1)
            .await
            .expect("processing");

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert!(store.find_stale_processing(cutoff).await.expect("find").is_empty());

        store.backdate(job.id, Utc::now() - chrono::Duration::minutes(10));
        let stale = store.find_stale_processing(cutoff).await.expect("find");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, job.id);
    }

    #[tokio::test]
    async fn test_discard_submission_removes_jobs() {
        let (store, job) = store_with_job(3).await;
        store
            .discard_submission(job.submission_id)
            .await
            .expect("discard");

        assert!(store.get_job(job.id).await.expect("get").is_none());
        assert!(store
            .get_submission(job.submission_id)
            .await
            .expect("get")
            .is_none());
    }
}

//! Job store abstraction.
//!
//! The store owns the persisted job state machine. Every implementation
//! must reject transitions that [`JobStatus::can_transition_to`] forbids and
//! apply submission bookkeeping in the same write that makes a job terminal.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::scheduler::job::{JobOutcome, JobStatus};

/// Status of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    /// At least one child job is not terminal.
    Pending,
    /// Every child job is terminal.
    Completed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for SubmissionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SubmissionStatus::Pending),
            "completed" => Ok(SubmissionStatus::Completed),
            other => Err(format!("unknown submission status '{}'", other)),
        }
    }
}

/// A batch of jobs created from one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub total_repos: u32,
    pub processed_repos: u32,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub repo_url: String,
    pub status: JobStatus,
    pub result: Option<bool>,
    pub reason: Option<String>,
    pub logs: String,
    pub setup_instructions: Option<String>,
    /// Execution time of the attempt that produced the terminal outcome.
    pub execution_time_ms: Option<u64>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a fresh `pending` record.
    pub fn new(submission_id: Uuid, repo_url: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            submission_id,
            repo_url: repo_url.into(),
            status: JobStatus::Pending,
            result: None,
            reason: None,
            logs: String::new(),
            setup_instructions: None,
            execution_time_ms: None,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns whether no further attempt will be made for this job.
    ///
    /// A `failed` row is terminal when it carries a result or has no
    /// attempts left.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => self.result.is_some() || self.attempts >= self.max_attempts,
            JobStatus::Pending | JobStatus::Processing => false,
        }
    }

    /// Applies an attempt outcome to this record.
    pub(crate) fn apply(&mut self, outcome: &JobOutcome) {
        self.status = outcome.status;
        self.result = outcome.result;
        self.reason = outcome.reason.clone();
        self.logs = outcome.logs.clone();
        self.setup_instructions = outcome.setup_instructions.clone();
        self.execution_time_ms = outcome.execution_time.map(|d| d.as_millis() as u64);
        self.attempts = outcome.attempts;
        self.updated_at = Utc::now();
    }
}

/// Persistent storage for submissions and jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a submission and one `pending` job per URL in a single
    /// transaction.
    async fn create_submission(
        &self,
        repo_urls: &[String],
        max_attempts: u32,
    ) -> Result<(Submission, Vec<JobRecord>), PersistenceError>;

    /// Deletes a submission and all of its jobs.
    async fn discard_submission(&self, submission_id: Uuid) -> Result<(), PersistenceError>;

    async fn get_submission(&self, submission_id: Uuid)
        -> Result<Option<Submission>, PersistenceError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, PersistenceError>;

    async fn list_jobs(&self, submission_id: Uuid) -> Result<Vec<JobRecord>, PersistenceError>;

    /// Moves a job to `status` and records the attempt counter.
    ///
    /// Used when entering `processing` and when taking the retry edge back
    /// to `pending`.
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        attempts: u32,
    ) -> Result<(), PersistenceError>;

    /// Writes the outcome of an attempt. A terminal outcome also advances
    /// the owning submission in the same write.
    async fn update_job_result(
        &self,
        job_id: Uuid,
        outcome: &JobOutcome,
    ) -> Result<(), PersistenceError>;

    /// Jobs in `processing` whose last update is older than `older_than`.
    async fn find_stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, PersistenceError>;
}

/// Rejects a transition the state machine forbids.
pub(crate) fn check_transition(
    record: &JobRecord,
    next: JobStatus,
    attempts: u32,
) -> Result<(), PersistenceError> {
    if !record
        .status
        .can_transition_to(next, attempts, record.max_attempts)
    {
        return Err(PersistenceError::InvalidTransition {
            job_id: record.id,
            from: record.status.to_string(),
            to: next.to_string(),
        });
    }
    if attempts > record.max_attempts {
        return Err(PersistenceError::InvalidTransition {
            job_id: record.id,
            from: format!("{} (attempt {})", record.status, record.attempts),
            to: format!("{} (attempt {} of {})", next, attempts, record.max_attempts),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_record_is_pending() {
        let record = JobRecord::new(Uuid::new_v4(), "https://example.com/r.git", 3);
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert!(record.result.is_none());
        assert!(!record.is_terminal());
    }

    #[test]
    fn test_failed_record_terminality() {
        let mut record = JobRecord::new(Uuid::new_v4(), "https://example.com/r.git", 3);
        record.status = JobStatus::Processing;
        record.apply(&JobOutcome::retryable_failure("clone failed", "", None, 1));
        assert!(!record.is_terminal());

        record.attempts = 3;
        assert!(record.is_terminal());

        record.attempts = 1;
        record.result = Some(false);
        assert!(record.is_terminal());
    }

    #[test]
    fn test_apply_records_execution_time_in_millis() {
        let mut record = JobRecord::new(Uuid::new_v4(), "https://example.com/r.git", 3);
        record.apply(&JobOutcome::completed(
            true,
            "Setup completed successfully",
            "ok",
            Some("npm install".to_string()),
            Duration::from_millis(2500),
            1,
        ));
        assert_eq!(record.execution_time_ms, Some(2500));
        assert_eq!(record.result, Some(true));
        assert!(record.is_terminal());
    }

    #[test]
    fn test_check_transition_rejects_regression() {
        let mut record = JobRecord::new(Uuid::new_v4(), "https://example.com/r.git", 3);
        record.status = JobStatus::Completed;

        let err = check_transition(&record, JobStatus::Processing, 1)
            .expect_err("completed -> processing must be rejected");
        assert!(matches!(err, PersistenceError::InvalidTransition { .. }));
    }

    #[test]
    fn test_check_transition_rejects_attempts_over_limit() {
        let record = JobRecord::new(Uuid::new_v4(), "https://example.com/r.git", 2);
        assert!(check_transition(&record, JobStatus::Processing, 2).is_ok());
        assert!(check_transition(&record, JobStatus::Processing, 3).is_err());
    }
}

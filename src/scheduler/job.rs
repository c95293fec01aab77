//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Job`: The queue message a worker dequeues (one repository to verify)
//! - `JobStatus`: Persisted status with its transition rules
//! - `JobOutcome`: The single write produced by one attempt

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default maximum number of attempts for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A job representing one repository to verify.
///
/// Jobs travel through the broker serialized as JSON. The attempt counter is
/// carried on the message so a retry knows how many attempts were consumed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Identifier of the persisted job record.
    pub id: Uuid,
    /// Submission this job belongs to.
    pub submission_id: Uuid,
    /// Repository to clone.
    pub repo_url: String,
    /// When this job was first enqueued.
    pub created_at: DateTime<Utc>,
    /// Number of attempts started so far.
    pub attempts: u32,
    /// Maximum number of attempts before the job fails terminally.
    pub max_attempts: u32,
}

impl Job {
    /// Creates a new job with zero attempts and the default attempt limit.
    pub fn new(id: Uuid, repo_url: impl Into<String>, submission_id: Uuid) -> Self {
        Self {
            id,
            submission_id,
            repo_url: repo_url.into(),
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Increments the attempt counter.
    ///
    /// Called once at the start of every attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether another attempt is allowed after a retryable failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Returns how long ago the job was created.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Persisted status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// Held by a worker.
    Processing,
    /// The pipeline ran to completion; `result` says whether setup passed.
    Completed,
    /// The attempt failed. Terminal once attempts are exhausted.
    Failed,
}

impl JobStatus {
    /// Returns the lowercase name stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Returns whether `self -> next` is a legal transition.
    ///
    /// `failed -> pending` is the retry edge and is only legal while
    /// `attempts < max_attempts`.
    pub fn can_transition_to(&self, next: JobStatus, attempts: u32, max_attempts: u32) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            (Failed, Pending) => attempts < max_attempts,
            _ => false,
        }
    }

    /// Statuses from which `next` may be reached, ignoring the attempt guard.
    pub fn allowed_predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Pending => &[JobStatus::Failed],
            JobStatus::Processing => &[JobStatus::Pending],
            JobStatus::Completed | JobStatus::Failed => &[JobStatus::Processing],
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// The record written by the reporter at the end of an attempt.
///
/// `result` is only set on outcomes that end the job through a normal
/// pipeline exit; a retryable failure leaves it `None`. A job abandoned by
/// the watchdog after its last attempt is terminal with no result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub result: Option<bool>,
    pub reason: Option<String>,
    pub logs: String,
    pub setup_instructions: Option<String>,
    #[serde(with = "duration_millis_opt")]
    pub execution_time: Option<Duration>,
    pub attempts: u32,
    pub terminal: bool,
}

impl JobOutcome {
    /// The pipeline ran to completion. `passed` reflects the command's exit code.
    pub fn completed(
        passed: bool,
        reason: impl Into<String>,
        logs: impl Into<String>,
        setup_instructions: Option<String>,
        execution_time: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            status: JobStatus::Completed,
            result: Some(passed),
            reason: Some(reason.into()),
            logs: logs.into(),
            setup_instructions,
            execution_time: Some(execution_time),
            attempts,
            terminal: true,
        }
    }

    /// The attempt failed and no further attempt will be made.
    pub fn terminal_failure(
        reason: impl Into<String>,
        logs: impl Into<String>,
        setup_instructions: Option<String>,
        execution_time: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            status: JobStatus::Failed,
            result: Some(false),
            reason: Some(reason.into()),
            logs: logs.into(),
            setup_instructions,
            execution_time: Some(execution_time),
            attempts,
            terminal: true,
        }
    }

    /// The attempt failed and the job will be retried.
    pub fn retryable_failure(
        reason: impl Into<String>,
        logs: impl Into<String>,
        setup_instructions: Option<String>,
        attempts: u32,
    ) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            reason: Some(reason.into()),
            logs: logs.into(),
            setup_instructions,
            execution_time: None,
            attempts,
            terminal: false,
        }
    }

    /// A stuck attempt was reclaimed with no attempts left.
    pub fn abandoned(reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            reason: Some(reason.into()),
            logs: String::new(),
            setup_instructions: None,
            execution_time: None,
            attempts,
            terminal: true,
        }
    }

    /// Returns whether this outcome ends the job.
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

//! Error types for repo-verifier operations.
//!
//! Defines the error taxonomy shared by the verification pipeline:
//! - Sandbox runtime operations (create, start, wait, logs, destroy)
//! - Repository fetching into per-attempt workspaces
//! - Instruction resolution (soft-failing)
//! - Job persistence
//!
//! Each attempt-level failure is wrapped in [`VerifyError`], which knows its
//! [`FailureClass`] and whether it should consume an attempt and be retried.

use thiserror::Error;
use uuid::Uuid;

use crate::storage::DatabaseError;

/// Classification of failures, used for retry decisions and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Broker or other connection-level failure. Retried by the worker loop
    /// without consuming an attempt.
    TransientInfra,
    /// Repository could not be cloned.
    Fetch,
    /// Instruction resolver failed. Never blocks the pipeline.
    Resolution,
    /// The isolation backend could not create or run the environment.
    SandboxCreation,
    /// The command under test exited non-zero. A deterministic outcome.
    ExecutionNonZero,
    /// The command or the whole attempt ran past its time budget.
    ExecutionTimeout,
    /// The job store could not be written.
    Persistence,
}

impl FailureClass {
    /// Returns whether a failure of this class consumes an attempt and is
    /// re-enqueued with backoff.
    pub fn consumes_attempt(&self) -> bool {
        matches!(
            self,
            FailureClass::Fetch | FailureClass::SandboxCreation | FailureClass::ExecutionTimeout
        )
    }

    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::TransientInfra => "transient_infra",
            FailureClass::Fetch => "fetch",
            FailureClass::Resolution => "resolution",
            FailureClass::SandboxCreation => "sandbox_creation",
            FailureClass::ExecutionNonZero => "execution_non_zero",
            FailureClass::ExecutionTimeout => "execution_timeout",
            FailureClass::Persistence => "persistence",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a sandbox runtime backend.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Failed to create sandbox: {0}")]
    CreateFailed(String),

    #[error("Failed to start sandbox '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    #[error("Sandbox '{id}' not found")]
    NotFound { id: String },

    #[error("Sandbox execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Sandbox wait was cancelled")]
    Cancelled,

    #[error("Failed to read sandbox logs: {0}")]
    LogsFailed(String),

    #[error("Failed to destroy sandbox '{id}': {reason}")]
    DestroyFailed { id: String, reason: String },

    #[error("Sandbox runtime error: {0}")]
    Runtime(String),
}

/// Errors that can occur while fetching a repository into a workspace.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("git clone of {url} failed: {message}")]
    CloneFailed { url: String, message: String },

    #[error("git clone of {url} was cancelled")]
    Cancelled { url: String },
}

/// Errors from an instruction resolver. The pipeline swallows all of them.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Failed to parse resolver response: {0}")]
    ParseError(String),
}

/// Errors that can occur while persisting job state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Submission {0} not found")]
    SubmissionNotFound(Uuid),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl PersistenceError {
    /// Returns whether retrying the same write could succeed.
    ///
    /// Invalid transitions and missing rows are permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PersistenceError::Unavailable(_) | PersistenceError::Database(_)
        )
    }
}

/// A failed verification attempt.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Sandbox error: {0}")]
    Sandbox(SandboxError),

    #[error("Setup command exceeded timeout of {seconds}s")]
    ExecutionTimeout { seconds: u64 },

    /// The per-job deadline fired before the pipeline produced a result.
    #[error("timeout")]
    DeadlineExceeded,
}

impl VerifyError {
    /// Returns the failure class of this error.
    pub fn class(&self) -> FailureClass {
        match self {
            VerifyError::Fetch(_) => FailureClass::Fetch,
            VerifyError::Sandbox(_) => FailureClass::SandboxCreation,
            VerifyError::ExecutionTimeout { .. } | VerifyError::DeadlineExceeded => {
                FailureClass::ExecutionTimeout
            }
        }
    }

    /// Returns whether the attempt may be retried.
    pub fn is_retryable(&self) -> bool {
        self.class().consumes_attempt()
    }
}

impl From<SandboxError> for VerifyError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout { seconds } => VerifyError::ExecutionTimeout { seconds },
            SandboxError::Cancelled => VerifyError::DeadlineExceeded,
            other => VerifyError::Sandbox(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(FailureClass::Fetch.consumes_attempt());
        assert!(FailureClass::SandboxCreation.consumes_attempt());
        assert!(FailureClass::ExecutionTimeout.consumes_attempt());

        assert!(!FailureClass::ExecutionNonZero.consumes_attempt());
        assert!(!FailureClass::Resolution.consumes_attempt());
        assert!(!FailureClass::TransientInfra.consumes_attempt());
        assert!(!FailureClass::Persistence.consumes_attempt());
    }

    #[test]
    fn test_sandbox_timeout_becomes_execution_timeout() {
        let err: VerifyError = SandboxError::Timeout { seconds: 30 }.into();
        assert!(matches!(err, VerifyError::ExecutionTimeout { seconds: 30 }));
        assert_eq!(err.class(), FailureClass::ExecutionTimeout);
        assert!(err.to_string().contains("timeout"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_sandbox_failure_is_creation_class() {
        let err: VerifyError = SandboxError::CreateFailed("no such image".to_string()).into();
        assert_eq!(err.class(), FailureClass::SandboxCreation);
        assert!(err.to_string().contains("no such image"));
    }

    #[test]
    fn test_deadline_reason_is_timeout() {
        let err = VerifyError::DeadlineExceeded;
        assert_eq!(err.to_string(), "timeout");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_fetch_error_message_is_preserved() {
        let err: VerifyError = FetchError::CloneFailed {
            url: "https://example.invalid/repo.git".to_string(),
            message: "Could not resolve host".to_string(),
        }
        .into();

        assert_eq!(err.class(), FailureClass::Fetch);
        assert!(err.to_string().contains("Could not resolve host"));
        assert!(err.to_string().contains("https://example.invalid/repo.git"));
    }

    #[test]
    fn test_persistence_error_transience() {
        assert!(PersistenceError::Unavailable("down".to_string()).is_transient());
        assert!(!PersistenceError::JobNotFound(Uuid::nil()).is_transient());
        assert!(!PersistenceError::InvalidTransition {
            job_id: Uuid::nil(),
            from: "completed".to_string(),
            to: "processing".to_string(),
        }
        .is_transient());
    }
}

//! Verification pipeline for a single attempt.
//!
//! This module provides the `VerificationPipeline` that runs one attempt of a
//! job end to end:
//! - Repository fetch into a fresh workspace
//! - README lookup and setup instruction resolution
//! - Sandboxed execution of the resolved command
//! - Conversion of the result into a [`JobOutcome`]
//!
//! The pipeline never returns an error: every failure is folded into the
//! [`AttemptReport`] together with the job log accumulated so far.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FailureClass, VerifyError};
use crate::execution::{RunStatus, SandboxExecutor};
use crate::resolver::{read_readme, InstructionResolver};
use crate::scheduler::job::{Job, JobOutcome};
use crate::scheduler::queue::JobBroker;
use crate::workspace::RepositoryFetcher;

/// Reason recorded when the command exits with code 0.
pub const REASON_PASSED: &str = "Setup completed successfully";

/// Reason recorded when there is nothing to run.
pub const REASON_NO_INSTRUCTIONS: &str = "No setup instructions found";

/// Queue progress reported at each stage.
pub mod progress {
    pub const STARTED: u8 = 10;
    pub const CLONED: u8 = 30;
    pub const RESOLVED: u8 = 50;
    pub const EXECUTING: u8 = 70;
    pub const FINISHED: u8 = 90;
}

/// Line-oriented log of one attempt, stored in the job's `logs` column.
#[derive(Debug, Default, Clone)]
pub struct JobLog {
    text: String,
}

impl JobLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one line.
    pub fn line(&mut self, message: impl AsRef<str>) {
        self.text.push_str(message.as_ref());
        self.text.push('\n');
    }

    /// Appends raw output, terminating it with a newline if needed.
    pub fn append_output(&mut self, output: &str) {
        if output.is_empty() {
            return;
        }
        self.text.push_str(output);
        if !output.ends_with('\n') {
            self.text.push('\n');
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// How the pipeline ended.
#[derive(Debug)]
pub enum AttemptResult {
    /// The pipeline reached a verdict.
    Verdict { passed: bool, reason: String },
    /// The attempt failed before reaching a verdict.
    Failed(VerifyError),
}

/// Everything one attempt produced.
#[derive(Debug)]
pub struct AttemptReport {
    pub result: AttemptResult,
    pub logs: String,
    pub setup_instructions: Option<String>,
    pub duration: Duration,
}

impl AttemptReport {
    /// Report for an attempt stopped by its deadline.
    ///
    /// Keeps whatever log the attempt produced while tearing down.
    pub fn deadline_exceeded(
        partial: Option<AttemptReport>,
        deadline: Duration,
        duration: Duration,
    ) -> Self {
        let (mut logs, setup_instructions) = match partial {
            Some(report) => (report.logs, report.setup_instructions),
            None => (String::new(), None),
        };
        logs.push_str(&format!(
            "Error: attempt exceeded its deadline of {}s (timeout)\n",
            deadline.as_secs()
        ));
        Self {
            result: AttemptResult::Failed(VerifyError::DeadlineExceeded),
            logs,
            setup_instructions,
            duration,
        }
    }

    /// Failure class of a failed attempt.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match &self.result {
            AttemptResult::Failed(err) => Some(err.class()),
            AttemptResult::Verdict { .. } => None,
        }
    }

    /// Short reason string for this report.
    pub fn reason(&self) -> String {
        match &self.result {
            AttemptResult::Verdict { reason, .. } => reason.clone(),
            AttemptResult::Failed(err) => err.to_string(),
        }
    }

    /// Converts the report into the outcome written for attempt `attempts`.
    ///
    /// A retryable failure with attempts left becomes a retry outcome; with
    /// none left it becomes a terminal failure with `result = false`.
    pub fn into_outcome(self, attempts: u32, max_attempts: u32) -> JobOutcome {
        match self.result {
            AttemptResult::Verdict { passed, reason } => JobOutcome::completed(
                passed,
                reason,
                self.logs,
                self.setup_instructions,
                self.duration,
                attempts,
            ),
            AttemptResult::Failed(err) if err.is_retryable() && attempts < max_attempts => {
                JobOutcome::retryable_failure(
                    err.to_string(),
                    self.logs,
                    self.setup_instructions,
                    attempts,
                )
            }
            AttemptResult::Failed(err) => JobOutcome::terminal_failure(
                err.to_string(),
                self.logs,
                self.setup_instructions,
                self.duration,
                attempts,
            ),
        }
    }
}

/// Runs fetch, resolve and execute for one attempt of a job.
pub struct VerificationPipeline {
    fetcher: Arc<dyn RepositoryFetcher>,
    resolver: Arc<dyn InstructionResolver>,
    executor: SandboxExecutor,
    broker: Option<Arc<dyn JobBroker>>,
    default_command: Option<String>,
}

impl VerificationPipeline {
    /// Creates a pipeline with no default command and no progress reporting.
    pub fn new(
        fetcher: Arc<dyn RepositoryFetcher>,
        resolver: Arc<dyn InstructionResolver>,
        executor: SandboxExecutor,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            executor,
            broker: None,
            default_command: None,
        }
    }

    /// Command used when the resolver finds nothing.
    pub fn with_default_command(mut self, command: Option<String>) -> Self {
        self.default_command = command.filter(|c| !c.trim().is_empty());
        self
    }

    /// Publishes stage progress to the broker.
    pub fn with_progress(mut self, broker: Arc<dyn JobBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Name of the sandbox for one attempt.
    pub fn sandbox_name(job_id: Uuid, attempt_id: Uuid) -> String {
        format!("verify-{}-{}", job_id, attempt_id)
    }

    async fn set_progress(&self, job_id: Uuid, value: u8) {
        if let Some(broker) = &self.broker {
            if let Err(e) = broker.set_progress(job_id, value).await {
                debug!(job_id = %job_id, error = %e, "Failed to publish progress");
            }
        }
    }

    /// Resolves the command for a cloned workspace. Never fails.
    async fn resolve_command(&self, job_id: Uuid, workspace: &std::path::Path) -> Option<String> {
        let resolved = match read_readme(workspace).await {
            Some(readme) => match self.resolver.resolve(&readme).await {
                Ok(command) => command,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Instruction resolver failed, using default");
                    None
                }
            },
            None => {
                debug!(job_id = %job_id, "No README found");
                None
            }
        };
        resolved
            .filter(|c| !c.trim().is_empty())
            .or_else(|| self.default_command.clone())
    }

    /// Runs one attempt. `cancel` firing stops the clone or sandbox wait and
    /// yields a deadline failure.
    pub async fn run(&self, job: &Job, attempt_id: Uuid, cancel: &CancellationToken) -> AttemptReport {
        let started = Instant::now();
        let mut log = JobLog::new();
        let mut setup_instructions = None;

        let result = self
            .run_stages(job, attempt_id, cancel, &mut log, &mut setup_instructions)
            .await;

        let result = match result {
            Ok(result) => result,
            Err(err) => {
                // Any error raised after cancellation is the deadline's doing.
                let err = if cancel.is_cancelled() {
                    VerifyError::DeadlineExceeded
                } else {
                    err
                };
                log.line(format!("Error: {}", err));
                AttemptResult::Failed(err)
            }
        };

        AttemptReport {
            result,
            logs: log.into_string(),
            setup_instructions,
            duration: started.elapsed(),
        }
    }

    async fn run_stages(
        &self,
        job: &Job,
        attempt_id: Uuid,
        cancel: &CancellationToken,
        log: &mut JobLog,
        setup_instructions: &mut Option<String>,
    ) -> Result<AttemptResult, VerifyError> {
        log.line(format!("Starting processing for {}", job.repo_url));
        self.set_progress(job.id, progress::STARTED).await;

        log.line("Cloning repository...");
        let workspace = self
            .fetcher
            .fetch(&job.repo_url, job.id, attempt_id, cancel)
            .await?;
        log.line("Repository cloned successfully");
        self.set_progress(job.id, progress::CLONED).await;

        log.line("Extracting setup instructions...");
        let command = self.resolve_command(job.id, workspace.path()).await;
        log.line(format!(
            "Setup instructions extracted: {}",
            if command.is_some() { "Yes" } else { "No" }
        ));
        self.set_progress(job.id, progress::RESOLVED).await;

        let Some(command) = command else {
            return Ok(AttemptResult::Verdict {
                passed: false,
                reason: REASON_NO_INSTRUCTIONS.to_string(),
            });
        };
        *setup_instructions = Some(command.clone());

        if cancel.is_cancelled() {
            return Err(VerifyError::DeadlineExceeded);
        }

        log.line("Executing setup commands in Docker...");
        self.set_progress(job.id, progress::EXECUTING).await;
        let name = Self::sandbox_name(job.id, attempt_id);
        let run = self
            .executor
            .execute(&name, workspace.path(), &command, cancel)
            .await?;
        log.append_output(&run.logs);

        // The sandbox is gone; other exit paths clean up on drop.
        if let Err(e) = workspace.close() {
            warn!(job_id = %job.id, attempt_id = %attempt_id, error = %e, "Failed to remove workspace");
        }
        self.set_progress(job.id, progress::FINISHED).await;

        info!(
            job_id = %job.id,
            status = ?run.status,
            duration_ms = run.duration.as_millis() as u64,
            "Sandbox run finished"
        );

        match run.status {
            RunStatus::Exited(0) => Ok(AttemptResult::Verdict {
                passed: true,
                reason: REASON_PASSED.to_string(),
            }),
            RunStatus::Exited(code) => Ok(AttemptResult::Verdict {
                passed: false,
                reason: format!("Setup failed with exit code {}", code),
            }),
            RunStatus::TimedOut => Err(VerifyError::ExecutionTimeout {
                seconds: self.executor.config().limits.timeout_seconds,
            }),
            RunStatus::Cancelled => Err(VerifyError::DeadlineExceeded),
        }
    }
}

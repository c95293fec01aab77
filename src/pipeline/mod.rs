//! The verification pipeline and its configuration.
//!
//! # Pipeline Flow
//!
//! 1. **Fetch**: the repository is shallow-cloned into a fresh workspace
//! 2. **Resolve**: the README is handed to the instruction resolver; on any
//!    failure the configured default command is used
//! 3. **Execute**: the command runs in a sandbox with the workspace mounted
//! 4. **Report**: the verdict or failure becomes a [`JobOutcome`](crate::scheduler::JobOutcome)
//!
//! The worker pool wraps every run in the per-job deadline.
//!
//! # Example
//!
//! ```rust,ignore
//! use repo_verifier::pipeline::{VerificationPipeline, VerifierConfig};
//!
//! let config = VerifierConfig::from_env()?;
//! let pipeline = VerificationPipeline::new(fetcher, resolver, executor)
//!     .with_default_command(config.default_command.clone());
//!
//! let report = pipeline.run(&job, Uuid::new_v4(), &cancel).await;
//! let outcome = report.into_outcome(job.attempts, job.max_attempts);
//! ```

pub mod config;
pub mod orchestrator;

// Re-export main types for convenience
pub use config::{ConfigError, LlmConfig, VerifierConfig};
pub use orchestrator::{
    AttemptReport, AttemptResult, JobLog, VerificationPipeline, REASON_NO_INSTRUCTIONS,
    REASON_PASSED,
};

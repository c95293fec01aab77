//! repo-verifier: repository verification service.
//!
//! Jobs carrying a repository URL are drained from a shared queue by a pool
//! of workers. Each attempt clones the repository into its own workspace,
//! turns the README into setup commands and runs them in a resource-limited
//! sandbox, then records a verdict or schedules a retry.

pub mod cli;
pub mod error;
pub mod execution;
pub mod intake;
pub mod metrics;
pub mod pipeline;
pub mod resolver;
pub mod scheduler;
pub mod storage;
pub mod workspace;

// Re-export commonly used error types
pub use error::{
    FailureClass, FetchError, PersistenceError, ResolveError, SandboxError, VerifyError,
};

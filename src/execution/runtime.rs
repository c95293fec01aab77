//! The sandbox runtime capability.
//!
//! [`SandboxRuntime`] is the narrow interface the executor drives. The
//! Docker client and the scripted fake both implement it.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::resources::ExecutionLimits;
use crate::error::SandboxError;

/// Everything needed to create one isolated environment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentSpec {
    /// Unique name for the environment.
    pub name: String,
    /// Base image.
    pub image: String,
    /// Command and arguments, run as-is.
    pub command: Vec<String>,
    /// Working directory inside the environment.
    pub working_dir: String,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Memory, CPU and process ceilings.
    pub limits: ExecutionLimits,
    /// Network mode; `"none"` for full isolation.
    pub network_mode: String,
    /// Security options, e.g. `no-new-privileges`.
    pub security_opt: Vec<String>,
}

/// Opaque handle to a created environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle {
    pub id: String,
}

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl std::fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Docker ids are long; the short form is what `docker ps` shows.
        let short: String = self.id.chars().take(12).collect();
        f.write_str(&short)
    }
}

/// An isolation backend.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Creates (but does not start) an environment.
    async fn create(&self, spec: &EnvironmentSpec) -> Result<SandboxHandle, SandboxError>;

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Waits for the environment to exit and returns its exit code.
    ///
    /// Fails with [`SandboxError::Timeout`] once `timeout` elapses and with
    /// [`SandboxError::Cancelled`] when `cancel` fires. Neither stops the
    /// environment; the caller kills it.
    async fn wait(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<i64, SandboxError>;

    /// Forcibly stops a running environment.
    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;

    /// Combined stdout and stderr captured so far.
    async fn logs(&self, handle: &SandboxHandle) -> Result<String, SandboxError>;

    /// Removes the environment and anything it holds.
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display_is_short() {
        let handle = SandboxHandle::new("0123456789abcdef0123");
        assert_eq!(handle.to_string(), "0123456789ab");

        let handle = SandboxHandle::new("fake-1");
        assert_eq!(handle.to_string(), "fake-1");
    }
}

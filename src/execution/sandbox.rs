//! Sandboxed execution of setup commands.
//!
//! The executor drives a [`SandboxRuntime`] through one create, start, wait,
//! logs, destroy cycle. Once `create` has succeeded, `destroy` is called
//! exactly once, whatever happens afterwards.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::resources::ExecutionLimits;
use super::runtime::{EnvironmentSpec, SandboxHandle, SandboxRuntime};
use crate::error::SandboxError;
use crate::metrics;

/// Configuration for the sandbox environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Docker image to use.
    pub image: String,
    /// Mount point of the workspace, also the working directory.
    pub working_dir: String,
    /// Memory, CPU, process and time ceilings.
    pub limits: ExecutionLimits,
    /// Network mode ("none", "bridge", "host").
    pub network_mode: String,
    /// Security options passed to the runtime.
    pub security_opt: Vec<String>,
    /// Environment variables.
    pub env_vars: Vec<(String, String)>,
}

impl SandboxConfig {
    /// Creates a new sandbox configuration with defaults.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            working_dir: "/app".to_string(),
            limits: ExecutionLimits::default(),
            network_mode: "none".to_string(),
            security_opt: vec!["no-new-privileges".to_string()],
            env_vars: Vec::new(),
        }
    }

    /// Sets the memory limit in MB.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.limits.memory_mb = mb;
        self
    }

    /// Sets the CPU limit as a percentage of one core.
    pub fn with_cpu_percent(mut self, percent: u32) -> Self {
        self.limits.cpu_percent = percent;
        self
    }

    /// Sets the hard timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.limits.timeout_seconds = timeout.as_secs().max(1);
        self
    }

    /// Sets the network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new("node:18-alpine")
    }
}

/// How a started sandbox ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// The command exited with this code.
    Exited(i64),
    /// The hard timeout fired and the sandbox was killed.
    TimedOut,
    /// The attempt was cancelled and the sandbox was killed.
    Cancelled,
}

/// Result of one sandbox run.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    pub status: RunStatus,
    /// Combined stdout and stderr, up to the exit or the kill.
    pub logs: String,
    pub duration: Duration,
}

/// Runs commands against workspaces inside a sandbox runtime.
#[derive(Clone)]
pub struct SandboxExecutor {
    runtime: Arc<dyn SandboxRuntime>,
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: SandboxConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Builds the environment for `command` over `workspace`.
    pub fn environment_spec(&self, name: &str, workspace: &Path, command: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
            working_dir: self.config.working_dir.clone(),
            binds: vec![format!(
                "{}:{}:rw",
                workspace.display(),
                self.config.working_dir
            )],
            env: self
                .config
                .env_vars
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect(),
            limits: self.config.limits.clone(),
            network_mode: self.config.network_mode.clone(),
            security_opt: self.config.security_opt.clone(),
        }
    }

    /// Runs `command` in a fresh sandbox with `workspace` mounted.
    ///
    /// Creation and start failures are errors. A timeout or cancellation is
    /// reported through [`RunStatus`] so the logs captured up to the kill are
    /// kept.
    pub async fn execute(
        &self,
        name: &str,
        workspace: &Path,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<SandboxRun, SandboxError> {
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let spec = self.environment_spec(name, workspace, command);
        let executor = self.clone();
        let cancel = cancel.clone();

        // Owned by its own task: dropping this future must not leak a created sandbox.
        let lifecycle = tokio::spawn(async move { executor.create_run_destroy(spec, &cancel).await });
        match lifecycle.await {
            Ok(result) => result,
            Err(e) => Err(SandboxError::Runtime(format!("sandbox task failed: {}", e))),
        }
    }

    async fn create_run_destroy(
        &self,
        spec: EnvironmentSpec,
        cancel: &CancellationToken,
    ) -> Result<SandboxRun, SandboxError> {
        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                metrics::record_sandbox("create_failed");
                return Err(e);
            }
        };
        info!(sandbox = %handle, name = %spec.name, image = %spec.image, "Sandbox created");

        let result = self.run(&handle, cancel).await;

        if let Err(e) = self.runtime.destroy(&handle).await {
            warn!(sandbox = %handle, error = %e, "Failed to destroy sandbox");
        } else {
            debug!(sandbox = %handle, "Sandbox destroyed");
        }

        metrics::record_sandbox(match &result {
            Ok(SandboxRun {
                status: RunStatus::Exited(0),
                ..
            }) => "exit_zero",
            Ok(SandboxRun {
                status: RunStatus::Exited(_),
                ..
            }) => "exit_non_zero",
            Ok(SandboxRun {
                status: RunStatus::TimedOut,
                ..
            }) => "timeout",
            Ok(SandboxRun {
                status: RunStatus::Cancelled,
                ..
            }) => "cancelled",
            Err(_) => "start_failed",
        });

        result
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        cancel: &CancellationToken,
    ) -> Result<SandboxRun, SandboxError> {
        let started = Instant::now();
        self.runtime.start(handle).await?;

        let timeout = self.config.limits.timeout();
        let status = match self.runtime.wait(handle, timeout, cancel).await {
            Ok(code) => RunStatus::Exited(code),
            Err(SandboxError::Timeout { seconds }) => {
                warn!(sandbox = %handle, seconds, "Sandbox hit hard timeout, killing");
                self.kill(handle).await;
                RunStatus::TimedOut
            }
            Err(SandboxError::Cancelled) => {
                info!(sandbox = %handle, "Attempt cancelled, killing sandbox");
                self.kill(handle).await;
                RunStatus::Cancelled
            }
            Err(e) => {
                self.kill(handle).await;
                return Err(e);
            }
        };

        let logs = match self.runtime.logs(handle).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(sandbox = %handle, error = %e, "Failed to read sandbox logs");
                format!("[sandbox logs unavailable: {}]\n", e)
            }
        };

        Ok(SandboxRun {
            status,
            logs,
            duration: started.elapsed(),
        })
    }

    async fn kill(&self, handle: &SandboxHandle) {
        if let Err(e) = self.runtime.kill(handle).await {
            warn!(sandbox = %handle, error = %e, "Failed to kill sandbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::fake::{ScriptedBehavior, ScriptedRuntime};

    fn executor(runtime: Arc<ScriptedRuntime>, timeout: Duration) -> SandboxExecutor {
        SandboxExecutor::new(runtime, SandboxConfig::default().with_timeout(timeout))
    }

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.image, "node:18-alpine");
        assert_eq!(config.working_dir, "/app");
        assert_eq!(config.network_mode, "none");
        assert_eq!(config.limits.memory_mb, 512);
        assert_eq!(config.limits.cpu_percent, 50);
        assert!(config.security_opt.contains(&"no-new-privileges".to_string()));
    }

    #[test]
    fn test_environment_spec_binds_workspace() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedBehavior::exit(0)));
        let executor = SandboxExecutor::new(
            runtime,
            SandboxConfig::default().with_env("CI", "true"),
        );

        let spec = executor.environment_spec(
            "verify-1",
            Path::new("/tmp/job-1-a-xyz"),
            "npm install && npm start",
        );
        assert_eq!(spec.binds, vec!["/tmp/job-1-a-xyz:/app:rw".to_string()]);
        assert_eq!(
            spec.command,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "npm install && npm start".to_string()
            ]
        );
        assert_eq!(spec.env, vec!["CI=true".to_string()]);
        assert_eq!(spec.network_mode, "none");
    }

    #[tokio::test]
    async fn test_exit_codes_are_reported() {
        let runtime = Arc::new(
            ScriptedRuntime::new(ScriptedBehavior::Exit {
                code: 0,
                logs: "added 10 packages\n".to_string(),
            })
            .with_rule("exit 1", ScriptedBehavior::exit(1)),
        );
        let executor = executor(runtime.clone(), Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let ok = executor
            .execute("a", Path::new("/tmp/a"), "npm install", &cancel)
            .await
            .expect("run");
        assert_eq!(ok.status, RunStatus::Exited(0));
        assert!(ok.logs.contains("added 10 packages"));

        let bad = executor
            .execute("b", Path::new("/tmp/b"), "exit 1", &cancel)
            .await
            .expect("run");
        assert_eq!(bad.status, RunStatus::Exited(1));

        assert_eq!(runtime.created(), 2);
        assert_eq!(runtime.destroyed(), 2);
        assert_eq!(runtime.killed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_kills_and_keeps_logs() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedBehavior::Hang {
            logs: "server listening on 3000\n".to_string(),
        }));
        let executor = executor(runtime.clone(), Duration::from_secs(30));

        let run = executor
            .execute("a", Path::new("/tmp/a"), "npm start", &CancellationToken::new())
            .await
            .expect("run");

        assert_eq!(run.status, RunStatus::TimedOut);
        assert!(run.logs.contains("server listening"));
        assert_eq!(runtime.killed(), 1);
        assert_eq!(runtime.destroyed(), 1);
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_tears_down() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedBehavior::Hang {
            logs: String::new(),
        }));
        let executor = executor(runtime.clone(), Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let run = executor
            .execute("a", Path::new("/tmp/a"), "npm start", &cancel)
            .await
            .expect("run");
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(runtime.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_still_destroys_sandbox() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedBehavior::Hang {
            logs: String::new(),
        }));
        let executor = executor(runtime.clone(), Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            executor.execute("a", Path::new("/tmp/a"), "npm start", &cancel),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(runtime.created(), 1);
        assert_eq!(runtime.destroyed(), 0);

        cancel.cancel();
        for _ in 0..100 {
            if runtime.destroyed() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runtime.killed(), 1);
        assert_eq!(runtime.destroyed(), 1);
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_destroys_nothing() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedBehavior::FailCreate(
            "image not found".to_string(),
        )));
        let executor = executor(runtime.clone(), Duration::from_secs(10));

        let err = executor
            .execute("a", Path::new("/tmp/a"), "true", &CancellationToken::new())
            .await
            .expect_err("create fails");
        assert!(matches!(err, SandboxError::CreateFailed(_)));
        assert_eq!(runtime.destroyed(), 0);
    }

    #[tokio::test]
    async fn test_start_failure_still_destroys_once() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedBehavior::FailStart(
            "oci runtime error".to_string(),
        )));
        let executor = executor(runtime.clone(), Duration::from_secs(10));

        let err = executor
            .execute("a", Path::new("/tmp/a"), "true", &CancellationToken::new())
            .await
            .expect_err("start fails");
        assert!(matches!(err, SandboxError::StartFailed { .. }));
        assert_eq!(runtime.created(), 1);
        assert_eq!(runtime.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_creates_nothing() {
        let runtime = Arc::new(ScriptedRuntime::new(ScriptedBehavior::exit(0)));
        let executor = executor(runtime.clone(), Duration::from_secs(10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = executor
            .execute("a", Path::new("/tmp/a"), "true", &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SandboxError::Cancelled));
        assert_eq!(runtime.create_calls(), 0);
    }
}

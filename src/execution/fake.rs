//! Deterministic in-process sandbox runtime.
//!
//! [`ScriptedRuntime`] never runs anything. Each created environment picks a
//! [`ScriptedBehavior`] from the first rule whose pattern occurs in the
//! command, falling back to a default. Call counters let callers check that
//! every created environment was destroyed exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::runtime::{EnvironmentSpec, SandboxHandle, SandboxRuntime};
use crate::error::SandboxError;

/// What a scripted environment does.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedBehavior {
    /// Exits with `code` after writing `logs`.
    Exit { code: i64, logs: String },
    /// Writes `logs` and never exits.
    Hang { logs: String },
    /// `create` fails.
    FailCreate(String),
    /// `start` fails.
    FailStart(String),
}

impl ScriptedBehavior {
    pub fn exit(code: i64) -> Self {
        ScriptedBehavior::Exit {
            code,
            logs: String::new(),
        }
    }

    fn logs(&self) -> &str {
        match self {
            ScriptedBehavior::Exit { logs, .. } | ScriptedBehavior::Hang { logs } => logs,
            ScriptedBehavior::FailCreate(_) | ScriptedBehavior::FailStart(_) => "",
        }
    }
}

/// A [`SandboxRuntime`] driven by rules instead of a container engine.
pub struct ScriptedRuntime {
    default: ScriptedBehavior,
    rules: Vec<(String, ScriptedBehavior)>,
    live: Mutex<HashMap<String, ScriptedBehavior>>,
    specs: Mutex<Vec<EnvironmentSpec>>,
    create_calls: AtomicUsize,
    created: AtomicUsize,
    started: AtomicUsize,
    killed: AtomicUsize,
    destroyed: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new(default: ScriptedBehavior) -> Self {
        Self {
            default,
            rules: Vec::new(),
            live: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            killed: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Commands containing `pattern` get `behavior`.
    pub fn with_rule(mut self, pattern: impl Into<String>, behavior: ScriptedBehavior) -> Self {
        self.rules.push((pattern.into(), behavior));
        self
    }

    /// Number of `create` calls, including failed ones.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of environments successfully created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Environments created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.lock_live().len()
    }

    /// Specs of every successfully created environment, in order.
    pub fn specs(&self) -> Vec<EnvironmentSpec> {
        self.specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashMap<String, ScriptedBehavior>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn behavior_for(&self, spec: &EnvironmentSpec) -> ScriptedBehavior {
        let command = spec.command.join(" ");
        self.rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, behavior)| behavior.clone())
            .unwrap_or_else(|| self.default.clone())
    }

    fn lookup(&self, handle: &SandboxHandle) -> Result<ScriptedBehavior, SandboxError> {
        self.lock_live()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound {
                id: handle.id.clone(),
            })
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    async fn create(&self, spec: &EnvironmentSpec) -> Result<SandboxHandle, SandboxError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let behavior = self.behavior_for(spec);
        if let ScriptedBehavior::FailCreate(reason) = &behavior {
            return Err(SandboxError::CreateFailed(reason.clone()));
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SandboxHandle::new(format!("scripted-{}", n));
        self.lock_live().insert(handle.id.clone(), behavior);
        self.specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());
        Ok(handle)
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        match self.lookup(handle)? {
            ScriptedBehavior::FailStart(reason) => Err(SandboxError::StartFailed {
                id: handle.id.clone(),
                reason,
            }),
            _ => Ok(()),
        }
    }

    async fn wait(
        &self,
        handle: &SandboxHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<i64, SandboxError> {
        match self.lookup(handle)? {
            ScriptedBehavior::Exit { code, .. } => Ok(code),
            _ => {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => Err(SandboxError::Timeout {
                        seconds: timeout.as_secs(),
                    }),
                    _ = cancel.cancelled() => Err(SandboxError::Cancelled),
                }
            }
        }
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.lookup(handle)?;
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self, handle: &SandboxHandle) -> Result<String, SandboxError> {
        Ok(self.lookup(handle)?.logs().to_string())
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        self.lock_live()
            .remove(&handle.id)
            .map(|_| ())
            .ok_or_else(|| SandboxError::NotFound {
                id: handle.id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::resources::ExecutionLimits;

    fn spec(command: &str) -> EnvironmentSpec {
        EnvironmentSpec {
            name: "test".to_string(),
            image: "node:18-alpine".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()],
            working_dir: "/app".to_string(),
            binds: Vec::new(),
            env: Vec::new(),
            limits: ExecutionLimits::default(),
            network_mode: "none".to_string(),
            security_opt: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_rules_select_behavior() {
        let runtime = ScriptedRuntime::new(ScriptedBehavior::exit(0))
            .with_rule("exit 1", ScriptedBehavior::exit(1));
        let cancel = CancellationToken::new();

        let ok = runtime.create(&spec("true")).await.expect("create");
        let bad = runtime.create(&spec("exit 1")).await.expect("create");

        assert_eq!(
            runtime.wait(&ok, Duration::from_secs(1), &cancel).await.expect("wait"),
            0
        );
        assert_eq!(
            runtime.wait(&bad, Duration::from_secs(1), &cancel).await.expect("wait"),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_times_out() {
        let runtime = ScriptedRuntime::new(ScriptedBehavior::Hang {
            logs: "waiting...".to_string(),
        });
        let handle = runtime.create(&spec("sleep 1000")).await.expect("create");

        let err = runtime
            .wait(&handle, Duration::from_secs(5), &CancellationToken::new())
            .await
            .expect_err("must time out");
        assert!(matches!(err, SandboxError::Timeout { seconds: 5 }));
        assert_eq!(runtime.logs(&handle).await.expect("logs"), "waiting...");
    }

    #[tokio::test]
    async fn test_double_destroy_is_reported() {
        let runtime = ScriptedRuntime::new(ScriptedBehavior::exit(0));
        let handle = runtime.create(&spec("true")).await.expect("create");

        runtime.destroy(&handle).await.expect("first destroy");
        assert!(runtime.destroy(&handle).await.is_err());
        assert_eq!(runtime.destroyed(), 2);
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_creates_nothing() {
        let runtime =
            ScriptedRuntime::new(ScriptedBehavior::FailCreate("no such image".to_string()));
        assert!(runtime.create(&spec("true")).await.is_err());
        assert_eq!(runtime.create_calls(), 1);
        assert_eq!(runtime.created(), 0);
    }
}

//! Sandboxed execution layer.
//!
//! This module runs untrusted setup commands inside an isolated,
//! resource-bounded environment.
//!
//! # Architecture
//!
//! Sandbox lifecycle per attempt:
//! ```text
//! CREATE → START → WAIT (exit | timeout | cancel → KILL) → LOGS → DESTROY
//! ```
//!
//! `DESTROY` runs exactly once for every environment that was created.
//!
//! # Example
//!
//! ```ignore
//! use repo_verifier::execution::{DockerClient, SandboxConfig, SandboxExecutor};
//!
//! let runtime = Arc::new(DockerClient::new()?);
//! let executor = SandboxExecutor::new(runtime, SandboxConfig::default());
//! let run = executor
//!     .execute("verify-job-1", workspace.path(), "npm install && npm start", &cancel)
//!     .await?;
//! ```

pub mod docker_client;
pub mod fake;
pub mod resources;
pub mod runtime;
pub mod sandbox;

pub use docker_client::DockerClient;
pub use fake::{ScriptedBehavior, ScriptedRuntime};
pub use resources::ExecutionLimits;
pub use runtime::{EnvironmentSpec, SandboxHandle, SandboxRuntime};
pub use sandbox::{RunStatus, SandboxConfig, SandboxExecutor, SandboxRun};

//! Verifier configuration.
//!
//! This module gathers every tunable of the verifier: worker concurrency,
//! retry policy, per-job deadline, sandbox limits, watchdog cadence, backend
//! URLs and the instruction resolver endpoint.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::execution::SandboxConfig;
use crate::resolver::DEFAULT_SETUP_COMMAND;
use crate::scheduler::{RetryPolicy, WatchdogConfig, WorkerPoolConfig};

/// Extra time past deadline and grace before a `processing` row is stale.
const STALE_MARGIN: Duration = Duration::from_secs(60);

/// Model used when `LLM_MODEL` is not set.
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Endpoint of the OpenAI-compatible instruction resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
}

/// Configuration for a verifier process.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifierConfig {
    // Scheduling
    /// Worker count, queue name, deadline and shutdown settings.
    pub pool: WorkerPoolConfig,
    /// Attempt limit and backoff.
    pub retry: RetryPolicy,
    /// Stuck job reconciliation.
    pub watchdog: WatchdogConfig,

    // Execution
    /// Image, limits and isolation of the sandbox.
    pub sandbox: SandboxConfig,
    /// Directory under which per-attempt workspaces are created.
    pub workspace_root: PathBuf,
    /// Command used when no instructions can be resolved.
    pub default_command: Option<String>,

    // Backends
    /// Redis URL; the in-process broker is used when unset.
    pub redis_url: Option<String>,
    /// PostgreSQL URL; the in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Instruction resolver endpoint; the static resolver is used when unset.
    pub llm: Option<LlmConfig>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            pool: WorkerPoolConfig::default(),
            retry: RetryPolicy::default(),
            watchdog: WatchdogConfig::default(),
            sandbox: SandboxConfig::default(),
            workspace_root: std::env::temp_dir().join("repo-verifier"),
            default_command: Some(DEFAULT_SETUP_COMMAND.to_string()),
            redis_url: None,
            database_url: None,
            llm: None,
        }
    }
}

impl VerifierConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VERIFIER_WORKERS`: Number of workers (default: 2)
    /// - `VERIFIER_QUEUE_NAME`: Queue name (default: repo-verification)
    /// - `VERIFIER_MAX_ATTEMPTS`: Attempts per job (default: 3)
    /// - `VERIFIER_BACKOFF_BASE_MS`: First retry delay (default: 2000)
    /// - `VERIFIER_BACKOFF_FACTOR`: Backoff multiplier (default: 2)
    /// - `VERIFIER_BACKOFF_MAX_SECS`: Backoff cap (default: 300)
    /// - `VERIFIER_JOB_DEADLINE_SECS`: Per-job deadline (default: 300)
    /// - `VERIFIER_STALE_AFTER_SECS`: Age of a stuck `processing` row (default: deadline + grace + 60)
    /// - `VERIFIER_WATCHDOG_INTERVAL_SECS`: Watchdog cadence (default: 30)
    /// - `VERIFIER_IMAGE`: Sandbox image (default: node:18-alpine)
    /// - `VERIFIER_MEMORY_MB`: Sandbox memory limit (default: 512)
    /// - `VERIFIER_CPU_PERCENT`: Sandbox CPU quota in percent of one core (default: 50)
    /// - `VERIFIER_MAX_PROCESSES`: Sandbox process limit (default: 256)
    /// - `VERIFIER_SANDBOX_TIMEOUT_SECS`: Hard command timeout (default: 240)
    /// - `VERIFIER_NETWORK_MODE`: Sandbox network mode (default: none)
    /// - `VERIFIER_WORKSPACE_ROOT`: Workspace directory (default: $TMPDIR/repo-verifier)
    /// - `VERIFIER_DEFAULT_COMMAND`: Fallback command, empty to disable
    /// - `REDIS_URL`: Redis broker URL
    /// - `DATABASE_URL`: PostgreSQL connection URL
    /// - `LLM_API_BASE`, `LLM_API_KEY`, `LLM_MODEL`: Instruction resolver endpoint
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Scheduling
        if let Some(val) = lookup("VERIFIER_WORKERS") {
            config.pool.num_workers = parse_env_value(&val, "VERIFIER_WORKERS")?;
        }

        if let Some(val) = lookup("VERIFIER_QUEUE_NAME") {
            config.pool.queue_name = val;
        }

        if let Some(val) = lookup("VERIFIER_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_env_value(&val, "VERIFIER_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("VERIFIER_BACKOFF_BASE_MS") {
            let ms: u64 = parse_env_value(&val, "VERIFIER_BACKOFF_BASE_MS")?;
            config.retry.base_delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("VERIFIER_BACKOFF_FACTOR") {
            config.retry.factor = parse_env_value(&val, "VERIFIER_BACKOFF_FACTOR")?;
        }

        if let Some(val) = lookup("VERIFIER_BACKOFF_MAX_SECS") {
            let secs: u64 = parse_env_value(&val, "VERIFIER_BACKOFF_MAX_SECS")?;
            config.retry.max_delay = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("VERIFIER_JOB_DEADLINE_SECS") {
            let secs: u64 = parse_env_value(&val, "VERIFIER_JOB_DEADLINE_SECS")?;
            config = config.with_job_deadline(Duration::from_secs(secs));
        }

        if let Some(val) = lookup("VERIFIER_STALE_AFTER_SECS") {
            let secs: u64 = parse_env_value(&val, "VERIFIER_STALE_AFTER_SECS")?;
            config = config.with_stale_after(Duration::from_secs(secs));
        }

        if let Some(val) = lookup("VERIFIER_WATCHDOG_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "VERIFIER_WATCHDOG_INTERVAL_SECS")?;
            config.watchdog.interval = Duration::from_secs(secs);
        }

        // Sandbox
        if let Some(val) = lookup("VERIFIER_IMAGE") {
            config.sandbox.image = val;
        }

        if let Some(val) = lookup("VERIFIER_MEMORY_MB") {
            config.sandbox.limits.memory_mb = parse_env_value(&val, "VERIFIER_MEMORY_MB")?;
        }

        if let Some(val) = lookup("VERIFIER_CPU_PERCENT") {
            config.sandbox.limits.cpu_percent = parse_env_value(&val, "VERIFIER_CPU_PERCENT")?;
        }

        if let Some(val) = lookup("VERIFIER_MAX_PROCESSES") {
            config.sandbox.limits.max_processes = parse_env_value(&val, "VERIFIER_MAX_PROCESSES")?;
        }

        if let Some(val) = lookup("VERIFIER_SANDBOX_TIMEOUT_SECS") {
            config.sandbox.limits.timeout_seconds =
                parse_env_value(&val, "VERIFIER_SANDBOX_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("VERIFIER_NETWORK_MODE") {
            config.sandbox.network_mode = val;
        }

        if let Some(val) = lookup("VERIFIER_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(val);
        }

        if let Some(val) = lookup("VERIFIER_DEFAULT_COMMAND") {
            config.default_command = Some(val).filter(|v| !v.trim().is_empty());
        }

        // Backends
        config.redis_url = lookup("REDIS_URL").filter(|v| !v.is_empty());
        config.database_url = lookup("DATABASE_URL").filter(|v| !v.is_empty());

        if let Some(api_base) = lookup("LLM_API_BASE").filter(|v| !v.is_empty()) {
            config.llm = Some(LlmConfig {
                api_base,
                api_key: lookup("LLM_API_KEY").filter(|v| !v.is_empty()),
                model: lookup("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Scheduling validation
        if self.pool.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be greater than 0".to_string(),
            ));
        }

        if self.pool.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.retry.factor == 0 {
            return Err(ConfigError::ValidationFailed(
                "backoff factor must be greater than 0".to_string(),
            ));
        }

        if self.pool.job_deadline.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_deadline must be greater than 0".to_string(),
            ));
        }

        let reclaim_floor = self.pool.job_deadline + self.pool.teardown_grace;
        if self.pool.stale_after <= reclaim_floor || self.watchdog.stale_after <= reclaim_floor {
            return Err(ConfigError::ValidationFailed(
                "stale_after must exceed job_deadline plus teardown grace".to_string(),
            ));
        }

        if self.watchdog.interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "watchdog interval must be greater than 0".to_string(),
            ));
        }

        // Sandbox validation
        if self.sandbox.image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "sandbox image cannot be empty".to_string(),
            ));
        }

        if self.sandbox.limits.memory_mb < 6 {
            return Err(ConfigError::ValidationFailed(
                "memory_mb must be at least 6 MB".to_string(),
            ));
        }

        if !(1..=100).contains(&self.sandbox.limits.cpu_percent) {
            return Err(ConfigError::ValidationFailed(
                "cpu_percent must be between 1 and 100".to_string(),
            ));
        }

        if self.sandbox.limits.max_processes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_processes must be greater than 0".to_string(),
            ));
        }

        if self.sandbox.limits.timeout_seconds == 0
            || self.sandbox.limits.timeout() >= self.pool.job_deadline
        {
            return Err(ConfigError::ValidationFailed(
                "sandbox timeout must be greater than 0 and shorter than job_deadline".to_string(),
            ));
        }

        if self.sandbox.network_mode.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "network_mode cannot be empty".to_string(),
            ));
        }

        // Resolver validation
        if let Some(llm) = &self.llm {
            if llm.model.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "LLM model cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Builder method to set the number of workers.
    pub fn with_workers(mut self, count: usize) -> Self {
        self.pool.num_workers = count;
        self
    }

    /// Builder method to set the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.pool.queue_name = name.into();
        self
    }

    /// Builder method to set the attempt limit.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Builder method to set backoff base and factor.
    pub fn with_backoff(mut self, base: Duration, factor: u32) -> Self {
        self.retry.base_delay = base;
        self.retry.factor = factor;
        self
    }

    /// Builder method to set the per-job deadline.
    ///
    /// Also moves the stale threshold to deadline, grace and margin.
    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.pool.job_deadline = deadline;
        let stale_after = deadline + self.pool.teardown_grace + STALE_MARGIN;
        self.with_stale_after(stale_after)
    }

    /// Builder method to set the stale claim threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.pool.stale_after = stale_after;
        self.watchdog.stale_after = stale_after;
        self
    }

    /// Builder method to set the sandbox image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.sandbox.image = image.into();
        self
    }

    /// Builder method to set the sandbox memory limit.
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.sandbox.limits.memory_mb = mb;
        self
    }

    /// Builder method to set the sandbox CPU quota.
    pub fn with_cpu_percent(mut self, percent: u32) -> Self {
        self.sandbox.limits.cpu_percent = percent;
        self
    }

    /// Builder method to set the hard command timeout.
    pub fn with_sandbox_timeout(mut self, timeout: Duration) -> Self {
        self.sandbox.limits.timeout_seconds = timeout.as_secs();
        self
    }

    /// Builder method to set the sandbox network mode.
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.sandbox.network_mode = mode.into();
        self
    }

    /// Builder method to set the workspace root.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Builder method to set the fallback command.
    pub fn with_default_command(mut self, command: Option<String>) -> Self {
        self.default_command = command;
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Builder method to set the instruction resolver endpoint.
    pub fn with_llm(mut self, llm: LlmConfig) -> Self {
        self.llm = Some(llm);
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = VerifierConfig::default();
        assert_eq!(config.pool.num_workers, 2);
        assert_eq!(config.pool.job_deadline, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(2));
        assert_eq!(config.retry.factor, 2);
        assert_eq!(config.sandbox.image, "node:18-alpine");
        assert_eq!(config.sandbox.limits.memory_mb, 512);
        assert_eq!(config.sandbox.limits.cpu_percent, 50);
        assert_eq!(config.sandbox.network_mode, "none");
        assert_eq!(
            config.default_command.as_deref(),
            Some("npm install && npm start")
        );
        assert!(config.redis_url.is_none());
        assert!(config.llm.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = VerifierConfig::from_lookup(lookup(&[
            ("VERIFIER_WORKERS", "6"),
            ("VERIFIER_MAX_ATTEMPTS", "5"),
            ("VERIFIER_BACKOFF_BASE_MS", "500"),
            ("VERIFIER_JOB_DEADLINE_SECS", "600"),
            ("VERIFIER_IMAGE", "node:20-alpine"),
            ("VERIFIER_MEMORY_MB", "1024"),
            ("VERIFIER_DEFAULT_COMMAND", ""),
            ("REDIS_URL", "redis://queue:6379"),
            ("LLM_API_BASE", "http://litellm:4000"),
        ]))
        .expect("config");

        assert_eq!(config.pool.num_workers, 6);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
        assert_eq!(config.pool.job_deadline, Duration::from_secs(600));
        assert_eq!(config.pool.stale_after, Duration::from_secs(670));
        assert_eq!(config.watchdog.stale_after, Duration::from_secs(670));
        assert_eq!(config.sandbox.image, "node:20-alpine");
        assert_eq!(config.sandbox.limits.memory_mb, 1024);
        assert!(config.default_command.is_none());
        assert_eq!(config.redis_url.as_deref(), Some("redis://queue:6379"));

        let llm = config.llm.expect("llm");
        assert_eq!(llm.api_base, "http://litellm:4000");
        assert_eq!(llm.model, DEFAULT_LLM_MODEL);
        assert!(llm.api_key.is_none());
    }

    #[test]
    fn test_from_lookup_invalid_number() {
        let err = VerifierConfig::from_lookup(lookup(&[("VERIFIER_WORKERS", "many")]))
            .expect_err("invalid");
        assert!(err.to_string().contains("VERIFIER_WORKERS"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let result = VerifierConfig::default().with_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("num_workers"));
    }

    #[test]
    fn test_validation_zero_attempts() {
        let result = VerifierConfig::default().with_max_attempts(0).validate();
        assert!(result.unwrap_err().to_string().contains("max_attempts"));
    }

    #[test]
    fn test_validation_sandbox_timeout_must_fit_deadline() {
        let result = VerifierConfig::default()
            .with_sandbox_timeout(Duration::from_secs(300))
            .validate();
        assert!(result.unwrap_err().to_string().contains("sandbox timeout"));
    }

    #[test]
    fn test_validation_stale_after_too_short() {
        let result = VerifierConfig::default()
            .with_stale_after(Duration::from_secs(300))
            .validate();
        assert!(result.unwrap_err().to_string().contains("stale_after"));
    }

    #[test]
    fn test_validation_cpu_and_memory() {
        let result = VerifierConfig::default().with_cpu_percent(0).validate();
        assert!(result.unwrap_err().to_string().contains("cpu_percent"));

        let result = VerifierConfig::default().with_memory_mb(1).validate();
        assert!(result.unwrap_err().to_string().contains("memory_mb"));
    }

    #[test]
    fn test_validation_empty_image() {
        let result = VerifierConfig::default().with_image("").validate();
        assert!(result.unwrap_err().to_string().contains("image"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("TEST_VAR".to_string());
        assert!(err.to_string().contains("TEST_VAR"));

        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));
    }
}

//! Resource limits for sandbox execution.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Execution resource limits for a sandbox.
///
/// These limits control the resources available to the command under test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes. Swap is disabled.
    pub memory_mb: u64,
    /// Share of one CPU, in percent (50 = half a core).
    pub cpu_percent: u32,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
    /// Hard timeout in seconds before the sandbox is killed.
    pub timeout_seconds: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_percent: 50,
            max_processes: 256,
            timeout_seconds: 240, // 4 minutes, inside the 5 minute job deadline
        }
    }
}

impl ExecutionLimits {
    /// Creates new execution limits with the given parameters.
    pub fn new(memory_mb: u64, cpu_percent: u32, max_processes: u64, timeout_seconds: u64) -> Self {
        Self {
            memory_mb,
            cpu_percent,
            max_processes,
            timeout_seconds,
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Total memory including swap. Equal to the memory limit, so no swap.
    pub fn memory_swap_bytes(&self) -> i64 {
        self.memory_bytes()
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota for the configured percentage.
    ///
    /// Formula: quota = period * percent / 100
    /// e.g., 50% = 50000 quota (half of one CPU)
    pub fn cpu_quota(&self) -> i64 {
        self.cpu_period() * self.cpu_percent as i64 / 100
    }

    /// Hard timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.memory_mb, 512);
        assert_eq!(limits.cpu_percent, 50);
        assert_eq!(limits.timeout(), Duration::from_secs(240));
    }

    #[test]
    fn test_memory_bytes_and_swap() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
        assert_eq!(limits.memory_swap_bytes(), limits.memory_bytes());
    }

    #[test]
    fn test_cpu_quota() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 50_000);

        let limits = ExecutionLimits::new(1024, 200, 100, 60);
        assert_eq!(limits.cpu_quota(), 200_000);
    }
}

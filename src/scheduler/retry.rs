//! Retry policy with exponential backoff.

use std::time::Duration;

use super::job::DEFAULT_MAX_ATTEMPTS;

/// Controls how many attempts a job gets and how long to wait between them.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts per job, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per consumed attempt.
    pub factor: u32,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(2),
            factor: 2,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt limit and default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before re-enqueueing a job that has consumed `attempts` attempts.
    ///
    /// `base * factor^(attempts - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

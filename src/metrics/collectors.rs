//! Metric recording helpers for verifier operations.
//!
//! The `MetricsCollector` struct wraps the raw Prometheus metrics and provides
//! convenient methods for the worker pool and watchdog. All methods are no-ops
//! until [`init_metrics`](super::init_metrics) has run.

use super::prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, PERSISTENCE_RETRIES_TOTAL,
    QUEUE_DEPTH, RETRIES_TOTAL, SANDBOXES_TOTAL, WATCHDOG_RECLAIMS_TOTAL,
};
use crate::scheduler::QueueStats;

/// Metrics collector for recording verifier operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a finished attempt.
    ///
    /// # Arguments
    ///
    /// * `status` - Outcome status ("completed", "failed", "retry")
    /// * `result` - Verification verdict ("pass", "fail", "none")
    /// * `duration_secs` - Attempt duration in seconds
    pub fn record_job(&self, status: &str, result: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[status, result]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration.observe(duration_secs);
        }

        tracing::trace!(
            status = status,
            result = result,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record a scheduled retry for a failure class.
    pub fn record_retry(&self, class: &str) {
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.with_label_values(&[class]).inc();
        }
    }

    /// Record a watchdog reclaim ("requeued" or "abandoned").
    pub fn record_reclaim(&self, action: &str) {
        if let Some(reclaims) = WATCHDOG_RECLAIMS_TOTAL.get() {
            reclaims.with_label_values(&[action]).inc();
        }
    }

    /// Update queue depth gauges from a stats snapshot.
    pub fn update_queue_stats(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            let name = stats.queue_name.as_str();
            for (state, depth) in [
                ("waiting", stats.pending_jobs),
                ("active", stats.processing_jobs),
                ("delayed", stats.delayed_jobs),
                ("dead_letter", stats.dead_letter_jobs),
            ] {
                queue_depth.with_label_values(&[name, state]).set(depth as f64);
            }
        }

        tracing::trace!(
            queue_name = %stats.queue_name,
            total = stats.total_jobs(),
            "Updated queue depth metric"
        );
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}

/// Record one sandbox run by outcome label.
pub fn record_sandbox(outcome: &str) {
    if let Some(sandboxes) = SANDBOXES_TOTAL.get() {
        sandboxes.with_label_values(&[outcome]).inc();
    }
    tracing::trace!(outcome = outcome, "Recorded sandbox metric");
}

/// Record one retried store write.
pub fn record_persistence_retry() {
    if let Some(retries) = PERSISTENCE_RETRIES_TOTAL.get() {
        retries.inc();
    }
}

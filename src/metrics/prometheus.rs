//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by repo-verifier and
//! provides functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all repo-verifier metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of finished attempts, labeled by status and result.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock duration of an attempt in seconds.
pub static JOB_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Number of jobs in queue, labeled by queue name and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Retries scheduled, labeled by failure class.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Sandbox runs, labeled by outcome.
pub static SANDBOXES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Store writes that had to be retried.
pub static PERSISTENCE_RETRIES_TOTAL: OnceLock<prometheus::Counter> = OnceLock::new();

/// Jobs reclaimed by the watchdog, labeled by action.
pub static WATCHDOG_RECLAIMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording functions are no-ops until this has run.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("repo_verifier_jobs_total", "Total number of finished attempts"),
        &["status", "result"],
    )?;

    let job_duration = Histogram::with_opts(
        HistogramOpts::new(
            "repo_verifier_job_duration_seconds",
            "Attempt duration in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 240.0, 300.0, 600.0]),
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("repo_verifier_queue_depth", "Number of jobs in queue"),
        &["queue_name", "state"],
    )?;

    let jobs_in_progress = Gauge::new(
        "repo_verifier_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let retries_total = CounterVec::new(
        Opts::new("repo_verifier_retries_total", "Total retries scheduled"),
        &["class"],
    )?;

    // Sandbox metrics
    let sandboxes_total = CounterVec::new(
        Opts::new("repo_verifier_sandboxes_total", "Total sandbox runs"),
        &["outcome"],
    )?;

    // Persistence and recovery metrics
    let persistence_retries_total = prometheus::Counter::new(
        "repo_verifier_persistence_retries_total",
        "Total retried store writes",
    )?;

    let watchdog_reclaims_total = CounterVec::new(
        Opts::new(
            "repo_verifier_watchdog_reclaims_total",
            "Stuck jobs reclaimed by the watchdog",
        ),
        &["action"],
    )?;

    // Worker metrics
    let active_workers = Gauge::new("repo_verifier_active_workers", "Number of active workers")?;

    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(sandboxes_total.clone()))?;
    registry.register(Box::new(persistence_retries_total.clone()))?;
    registry.register(Box::new(watchdog_reclaims_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = SANDBOXES_TOTAL.set(sandboxes_total);
    let _ = PERSISTENCE_RETRIES_TOTAL.set(persistence_retries_total);
    let _ = WATCHDOG_RECLAIMS_TOTAL.set(watchdog_reclaims_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        // First call should succeed or metrics already initialized
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_metrics_after_init() {
        let _ = init_metrics();

        if let Some(sandboxes) = SANDBOXES_TOTAL.get() {
            sandboxes.with_label_values(&["exit_zero"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        if REGISTRY.get().is_some() {
            assert!(metrics.contains("repo_verifier_sandboxes_total"));
        }
    }
}

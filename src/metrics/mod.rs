//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for verifier
//! operations: job outcomes, queue depth, retries, sandbox runs and
//! watchdog reclaims.
//!
//! # Example
//!
//! ```ignore
//! use repo_verifier::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("completed", "pass", 42.0);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{record_persistence_retry, record_sandbox, MetricsCollector};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, JOBS_IN_PROGRESS, JOBS_TOTAL, JOB_DURATION, PERSISTENCE_RETRIES_TOTAL,
    QUEUE_DEPTH, REGISTRY, RETRIES_TOTAL, SANDBOXES_TOTAL, WATCHDOG_RECLAIMS_TOTAL,
};

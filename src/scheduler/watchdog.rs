//! Reconciliation of stuck jobs.
//!
//! A worker that dies mid-attempt leaves its job `processing` forever. The
//! watchdog periodically looks for such rows and either takes the retry edge
//! and re-enqueues the job, or fails it terminally with no result.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::Job;
use super::queue::JobBroker;
use crate::error::PersistenceError;
use crate::metrics::MetricsCollector;
use crate::storage::ResultReporter;

/// Configuration for the watchdog sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Age after which a `processing` row is considered stuck.
    pub stale_after: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(370),
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs put back on the queue.
    pub requeued: usize,
    /// Jobs failed terminally.
    pub abandoned: usize,
    /// Rows that changed under the sweep and were left alone.
    pub skipped: usize,
}

/// Periodic sweep over stale `processing` rows.
pub struct Watchdog {
    reporter: ResultReporter,
    broker: Arc<dyn JobBroker>,
    config: WatchdogConfig,
    metrics: MetricsCollector,
}

impl Watchdog {
    pub fn new(reporter: ResultReporter, broker: Arc<dyn JobBroker>, config: WatchdogConfig) -> Self {
        Self {
            reporter,
            broker,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Runs one sweep.
    pub async fn sweep(&self) -> Result<SweepReport, PersistenceError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - stale_after;
        let stale = self.reporter.store().find_stale_processing(cutoff).await?;

        let mut report = SweepReport::default();
        for record in stale {
            match self.reporter.reclaim(&record).await {
                Ok(Some(attempts)) => {
                    let job = Job {
                        id: record.id,
                        submission_id: record.submission_id,
                        repo_url: record.repo_url.clone(),
                        created_at: record.created_at,
                        attempts,
                        max_attempts: record.max_attempts,
                    };
                    match self.broker.enqueue(job).await {
                        Ok(_) => {
                            info!(job_id = %record.id, attempts, "Requeued stuck job");
                            self.metrics.record_reclaim("requeued");
                            report.requeued += 1;
                        }
                        Err(e) => {
                            // The row sits in pending; the next sweep cannot see it.
                            warn!(job_id = %record.id, error = %e, "Failed to requeue stuck job");
                            report.skipped += 1;
                        }
                    }
                }
                Ok(None) => {
                    warn!(job_id = %record.id, attempts = record.attempts, "Stuck job out of attempts, failed");
                    self.metrics.record_reclaim("abandoned");
                    report.abandoned += 1;
                }
                Err(PersistenceError::InvalidTransition { .. }) => {
                    debug!(job_id = %record.id, "Stuck job finished while being reclaimed");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(job_id = %record.id, error = %e, "Failed to reclaim stuck job");
                    report.skipped += 1;
                }
            }
        }

        if report.requeued + report.abandoned > 0 {
            info!(
                requeued = report.requeued,
                abandoned = report.abandoned,
                "Watchdog sweep reclaimed jobs"
            );
        }
        Ok(report)
    }

    /// Sweeps every interval until `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                stale_after_secs = self.config.stale_after.as_secs(),
                "Watchdog started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "Watchdog sweep failed");
                        }
                    }
                }
            }
            info!("Watchdog stopped");
        })
    }
}

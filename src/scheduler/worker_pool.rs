//! Worker pool for processing verification jobs from a broker.
//!
//! This module provides a pool of workers that process jobs from a shared
//! [`JobBroker`]. Each worker runs as an independent async task, pulls one
//! job at a time and drives it through the verification pipeline under a
//! per-job deadline.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Per-job deadline with cancellation and a teardown grace period
//! - Retry with exponential backoff for retryable failure classes
//! - Dead letter queue for exhausted jobs
//! - Connection-level retry when the broker is unreachable
//! - Graceful shutdown through a cancellation token
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::MetricsCollector;
use crate::pipeline::{AttemptReport, VerificationPipeline};
use crate::storage::{Claim, ResultReporter};

use super::job::{Job, JobOutcome, JobStatus};
use super::observer::{JobEvent, JobObserver};
use super::queue::{JobBroker, QueueError, QueueState};
use super::retry::RetryPolicy;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The broker could not be reached.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    /// The pool configuration cannot be used.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Name of the job queue.
    pub queue_name: String,
    /// How long one dequeue call blocks waiting for a job.
    pub poll_interval: Duration,
    /// Time budget for one attempt, from dequeue to result.
    pub job_deadline: Duration,
    /// Time an attempt gets to tear down after its deadline fires.
    pub teardown_grace: Duration,
    /// Age after which a `processing` row is considered abandoned.
    pub stale_after: Duration,
    /// First delay after a broker failure.
    pub reconnect_delay: Duration,
    /// Upper bound for the broker reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            queue_name: "repo-verification".to_string(),
            poll_interval: Duration::from_secs(1),
            job_deadline: Duration::from_secs(300), // 5 minutes
            teardown_grace: Duration::from_secs(10),
            stale_after: Duration::from_secs(370),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-job deadline.
    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline = deadline;
        self
    }

    /// Sets the teardown grace period.
    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.teardown_grace = grace;
        self
    }

    /// Sets the stale claim threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Sets the initial broker reconnect delay.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Delay before the `failures`-th consecutive reconnect.
    fn reconnect_backoff(&self, failures: u32) -> Duration {
        self.reconnect_delay
            .checked_mul(1 << failures.saturating_sub(1).min(16))
            .unwrap_or(self.max_reconnect_delay)
            .min(self.max_reconnect_delay)
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Total number of jobs that reached `completed`.
    pub jobs_completed: u64,
    /// Total number of jobs that failed terminally.
    pub jobs_failed: u64,
    /// Total number of retries scheduled.
    pub jobs_retried: u64,
    /// Average attempt duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs finished (completed + failed).
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the share of finished jobs that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    attempts: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_retried: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_attempt(&self, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_completion(&self) {
        self.jobs_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_retry(&self) {
        self.jobs_retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let attempts = self.attempts.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let average_duration = if attempts > 0 {
            Duration::from_millis(total_duration_ms / attempts)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a broker.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<dyn JobBroker>,
    reporter: ResultReporter,
    pipeline: Arc<VerificationPipeline>,
    retry: RetryPolicy,
    observers: Arc<Vec<Arc<dyn JobObserver>>>,
    /// Stops workers from taking new jobs.
    shutdown: CancellationToken,
    /// Cancels in-flight attempts; parent of every attempt token.
    abort: CancellationToken,
    workers: JoinSet<()>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool over an existing broker.
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<dyn JobBroker>,
        reporter: ResultReporter,
        pipeline: Arc<VerificationPipeline>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            config,
            broker,
            reporter,
            pipeline,
            retry,
            observers: Arc::new(Vec::new()),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            workers: JoinSet::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Registers an observer. Must be called before [`start`](Self::start).
    pub fn with_observer(mut self, observer: Arc<dyn JobObserver>) -> Self {
        Arc::make_mut(&mut self.observers).push(observer);
        self
    }

    /// Starts all workers in the pool.
    ///
    /// Jobs left in the broker's processing list by a previous run are
    /// recovered first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }
        if self.config.num_workers == 0 {
            return Err(PoolError::InvalidConfig(
                "num_workers must be greater than 0".to_string(),
            ));
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
            self.abort = CancellationToken::new();
        }

        match self.broker.recover_processing_jobs().await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(
                        recovered = recovered,
                        "Recovered jobs from processing queue"
                    );
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover processing jobs");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                broker: Arc::clone(&self.broker),
                reporter: self.reporter.clone(),
                pipeline: Arc::clone(&self.pipeline),
                retry: self.retry.clone(),
                observers: Arc::clone(&self.observers),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
                abort: self.abort.clone(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.workers.spawn(worker.run());
        }

        self.is_running.store(true, Ordering::SeqCst);
        MetricsCollector::new().update_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers stop taking jobs and finish the one in hand. If they are not
    /// done within the shutdown timeout, in-flight attempts are cancelled and
    /// given the teardown grace period before their tasks are aborted.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");
        self.shutdown.cancel();

        let shutdown_timeout = self.config.shutdown_timeout;
        let grace = self.config.teardown_grace;
        let drained = tokio::time::timeout(shutdown_timeout, drain(&mut self.workers)).await;

        self.is_running.store(false, Ordering::SeqCst);
        MetricsCollector::new().update_workers(0);

        if drained.is_ok() {
            info!("Worker pool shutdown complete");
            return Ok(());
        }

        warn!("Workers still busy after shutdown timeout, cancelling attempts");
        self.abort.cancel();
        if tokio::time::timeout(grace, drain(&mut self.workers))
            .await
            .is_err()
        {
            self.workers.abort_all();
        }
        Err(PoolError::ShutdownTimeout(shutdown_timeout))
    }

    /// Token cancelled when the pool starts shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Returns the broker the pool drains.
    pub fn broker(&self) -> &Arc<dyn JobBroker> {
        &self.broker
    }
}

async fn drain(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Worker task panicked during shutdown");
        }
    }
}

fn result_label(result: Option<bool>) -> &'static str {
    match result {
        Some(true) => "pass",
        Some(false) => "fail",
        None => "none",
    }
}

/// A single worker that processes jobs from the broker.
struct Worker {
    id: String,
    broker: Arc<dyn JobBroker>,
    reporter: ResultReporter,
    pipeline: Arc<VerificationPipeline>,
    retry: RetryPolicy,
    observers: Arc<Vec<Arc<dyn JobObserver>>>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
    abort: CancellationToken,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Main worker loop.
    ///
    /// Pulls jobs until the shutdown token fires. A broker failure never
    /// consumes an attempt; the worker backs off and tries again.
    async fn run(self) {
        info!(worker_id = %self.id, "Worker started");
        let mut broker_failures = 0u32;

        while !self.shutdown.is_cancelled() {
            match self.broker.dequeue(self.config.poll_interval).await {
                Ok(Some(job)) => {
                    broker_failures = 0;
                    self.process_job(job).await;
                }
                Ok(None) => {
                    broker_failures = 0;
                    debug!(worker_id = %self.id, "No jobs available");
                }
                Err(e) => {
                    broker_failures += 1;
                    let delay = self.config.reconnect_backoff(broker_failures);
                    warn!(
                        worker_id = %self.id,
                        error = %e,
                        failures = broker_failures,
                        "Failed to dequeue job, retrying in {:?}",
                        delay
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Processes a single delivered job.
    async fn process_job(&self, delivered: Job) {
        let job_id = delivered.id;
        let mut job = delivered.clone();
        job.increment_attempts();

        let attempts = match self
            .reporter
            .begin_attempt(&job, self.config.stale_after)
            .await
        {
            Ok(Claim::Claimed { attempts }) => attempts,
            Ok(claim) => {
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    claim = ?claim,
                    "Dropping duplicate delivery"
                );
                self.discard(job_id).await;
                return;
            }
            Err(e) if e.is_transient() => {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Job store unavailable, returning job to the queue"
                );
                // The message goes back untouched so no attempt is consumed.
                let delay = self.config.reconnect_backoff(1);
                if let Err(e) = self.broker.schedule_retry(delivered, delay).await {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to requeue job");
                }
                return;
            }
            Err(e) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Job could not be claimed, dropping delivery"
                );
                self.discard(job_id).await;
                return;
            }
        };
        job.attempts = attempts;

        let attempt_id = Uuid::new_v4();
        info!(
            worker_id = %self.id,
            job_id = %job_id,
            attempt = attempts,
            attempt_id = %attempt_id,
            repo_url = %job.repo_url,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_jobs_in_progress();
        let report = self.run_with_deadline(&job, attempt_id).await;
        self.metrics.dec_jobs_in_progress();
        self.stats.decrement_active();

        let duration = report.duration;
        self.stats.record_attempt(duration);
        let class = report.failure_class();
        let outcome = report.into_outcome(attempts, job.max_attempts);

        if let Err(e) = self
            .reporter
            .report_until_stored(job_id, &outcome, &self.abort)
            .await
        {
            if e.is_transient() {
                // Stopped before the store came back. The message returns to
                // the broker once the row is stale so the attempt is reclaimed.
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    attempt = attempts,
                    error = %e,
                    status = %outcome.status,
                    result = ?outcome.result,
                    reason = ?outcome.reason,
                    "Pool stopping with attempt outcome unpersisted, requeueing job"
                );
                if let Err(e) = self
                    .broker
                    .schedule_retry(delivered, self.config.stale_after)
                    .await
                {
                    error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to requeue job");
                }
            } else {
                warn!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    attempt = attempts,
                    error = %e,
                    "Attempt outcome rejected by the store, dropping delivery"
                );
                self.discard(job_id).await;
            }
            return;
        }

        if outcome.is_terminal() {
            self.finish(job, &outcome, duration).await;
        } else {
            let class = class.map(|c| c.as_str()).unwrap_or("unknown");
            self.schedule_retry(job, &outcome, class, duration).await;
        }
    }

    /// Runs the pipeline, cancelling it when the job deadline passes.
    async fn run_with_deadline(&self, job: &Job, attempt_id: Uuid) -> AttemptReport {
        let cancel = self.abort.child_token();
        let started = Instant::now();
        let run = self.pipeline.run(job, attempt_id, &cancel);
        tokio::pin!(run);

        tokio::select! {
            report = &mut run => return report,
            _ = tokio::time::sleep(self.config.job_deadline) => {}
        }

        warn!(
            worker_id = %self.id,
            job_id = %job.id,
            attempt = job.attempts,
            deadline_secs = self.config.job_deadline.as_secs(),
            "Job deadline reached, cancelling attempt"
        );
        cancel.cancel();
        let partial = tokio::time::timeout(self.config.teardown_grace, &mut run)
            .await
            .ok();
        if partial.is_none() {
            warn!(worker_id = %self.id, job_id = %job.id, "Attempt did not tear down within grace period");
        }
        AttemptReport::deadline_exceeded(partial, self.config.job_deadline, started.elapsed())
    }

    async fn finish(&self, job: Job, outcome: &JobOutcome, duration: Duration) {
        let job_id = job.id;
        let reason = outcome.reason.clone().unwrap_or_default();
        let status_label = outcome.status.as_str();
        self.metrics
            .record_job(status_label, result_label(outcome.result), duration.as_secs_f64());

        if outcome.status == JobStatus::Completed {
            self.stats.record_completion();
            info!(
                worker_id = %self.id,
                job_id = %job_id,
                attempt = outcome.attempts,
                result = ?outcome.result,
                duration_ms = duration.as_millis() as u64,
                "Job completed"
            );
            if let Err(e) = self.broker.complete(job_id, QueueState::Completed).await {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to mark job complete");
            }
            let event = JobEvent::Completed {
                job_id,
                submission_id: job.submission_id,
                passed: outcome.result == Some(true),
                reason,
            };
            for observer in self.observers.iter() {
                observer.on_completed(&event);
            }
        } else {
            self.stats.record_failure();
            error!(
                worker_id = %self.id,
                job_id = %job_id,
                attempt = outcome.attempts,
                reason = %reason,
                "Job failed, moving to dead letter queue"
            );
            let submission_id = job.submission_id;
            if let Err(e) = self.broker.dead_letter(job, &reason).await {
                error!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    error = %e,
                    "Failed to move job to dead letter queue"
                );
            }
            let event = JobEvent::Failed {
                job_id,
                submission_id,
                reason,
                attempts: outcome.attempts,
            };
            for observer in self.observers.iter() {
                observer.on_failed(&event);
            }
        }
    }

    async fn schedule_retry(&self, job: Job, outcome: &JobOutcome, class: &str, duration: Duration) {
        let job_id = job.id;
        let attempts = outcome.attempts;
        let delay = self.retry.backoff(attempts);
        let reason = outcome.reason.clone().unwrap_or_default();

        self.stats.record_retry();
        self.metrics.record_retry(class);
        self.metrics
            .record_job("retry", result_label(None), duration.as_secs_f64());

        warn!(
            worker_id = %self.id,
            job_id = %job_id,
            attempt = attempts,
            remaining_attempts = job.remaining_attempts(),
            class = class,
            reason = %reason,
            "Job failed, requeueing for retry in {:?}",
            delay
        );

        // A failed write here is repaired by the next claim of the job.
        if let Err(e) = self
            .reporter
            .update_status(job_id, JobStatus::Pending, attempts)
            .await
        {
            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to take retry edge");
        }

        if let Err(e) = self.broker.schedule_retry(job, delay).await {
            error!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to requeue job");
        }

        let event = JobEvent::Retrying {
            job_id,
            attempts,
            delay,
            reason,
        };
        for observer in self.observers.iter() {
            observer.on_retry(&event);
        }
    }

    async fn discard(&self, job_id: Uuid) {
        if let Err(e) = self.broker.discard(job_id).await {
            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to discard delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{SandboxConfig, SandboxExecutor, ScriptedBehavior, ScriptedRuntime};
    use crate::resolver::StaticResolver;
    use crate::scheduler::memory::InMemoryJobQueue;
    use crate::storage::InMemoryJobStore;
    use crate::workspace::GitFetcher;

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();

        assert_eq!(config.num_workers, 2);
        assert_eq!(config.queue_name, "repo-verification");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.job_deadline, Duration::from_secs(300));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(60));
        assert!(config.stale_after > config.job_deadline + config.teardown_grace);
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_queue_name("my_queue")
            .with_poll_interval(Duration::from_secs(5))
            .with_job_deadline(Duration::from_secs(600))
            .with_teardown_grace(Duration::from_secs(20))
            .with_stale_after(Duration::from_secs(700))
            .with_shutdown_timeout(Duration::from_secs(120));

        assert_eq!(config.num_workers, 8);
        assert_eq!(config.queue_name, "my_queue");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.job_deadline, Duration::from_secs(600));
        assert_eq!(config.teardown_grace, Duration::from_secs(20));
        assert_eq!(config.stale_after, Duration::from_secs(700));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let config = WorkerPoolConfig::default().with_reconnect_delay(Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff(1), Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff(2), Duration::from_secs(2));
        assert_eq!(config.reconnect_backoff(4), Duration::from_secs(8));
        assert_eq!(config.reconnect_backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn test_pool_stats_calculations() {
        let stats = PoolStats {
            num_workers: 4,
            active_workers: 2,
            jobs_completed: 80,
            jobs_failed: 20,
            jobs_retried: 7,
            average_job_duration: Duration::from_secs(60),
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
        assert!((PoolStats::default().success_rate() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_pool_stats() {
        let stats = SharedPoolStats::new();

        stats.record_attempt(Duration::from_secs(10));
        stats.record_attempt(Duration::from_secs(20));
        stats.record_attempt(Duration::from_secs(5));
        stats.record_completion();
        stats.record_completion();
        stats.record_failure();
        stats.record_retry();

        let pool_stats = stats.to_pool_stats(4);

        assert_eq!(pool_stats.num_workers, 4);
        assert_eq!(pool_stats.jobs_completed, 2);
        assert_eq!(pool_stats.jobs_failed, 1);
        assert_eq!(pool_stats.jobs_retried, 1);
        // Average: (10000 + 20000 + 5000) / 3 = 11666 ms
        assert!(pool_stats.average_job_duration.as_millis() > 11000);
        assert!(pool_stats.average_job_duration.as_millis() < 12000);
    }

    #[test]
    fn test_shared_pool_stats_active_workers() {
        let stats = SharedPoolStats::new();

        stats.increment_active();
        stats.increment_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 2);

        stats.decrement_active();
        assert_eq!(stats.active_workers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));

        let err = PoolError::NotRunning;
        assert!(err.to_string().contains("not running"));

        let err = PoolError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60"));
    }

    fn idle_pool(num_workers: usize) -> WorkerPool {
        let root = std::env::temp_dir().join("repo-verifier-pool-tests");
        let executor = SandboxExecutor::new(
            Arc::new(ScriptedRuntime::new(ScriptedBehavior::exit(0))),
            SandboxConfig::default(),
        );
        let pipeline = VerificationPipeline::new(
            Arc::new(GitFetcher::new(root)),
            Arc::new(StaticResolver::default()),
            executor,
        );
        WorkerPool::new(
            WorkerPoolConfig::new(num_workers).with_poll_interval(Duration::from_millis(20)),
            Arc::new(InMemoryJobQueue::new("pool-tests")),
            ResultReporter::new(Arc::new(InMemoryJobStore::new())),
            Arc::new(pipeline),
            RetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_pool_start_and_shutdown() {
        let mut pool = idle_pool(3);
        assert!(matches!(pool.shutdown().await, Err(PoolError::NotRunning)));

        pool.start().await.expect("start");
        assert!(pool.is_running());
        assert!(matches!(pool.start().await, Err(PoolError::AlreadyRunning)));

        pool.shutdown().await.expect("shutdown");
        assert!(!pool.is_running());
        assert!(pool.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_pool_rejects_zero_workers() {
        let mut pool = idle_pool(0);
        assert!(matches!(
            pool.start().await,
            Err(PoolError::InvalidConfig(_))
        ));
    }
}

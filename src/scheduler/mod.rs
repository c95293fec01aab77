//! Job scheduling: brokers, the worker pool, retries and the watchdog.
//!
//! This module provides the asynchronous core of the verifier:
//!
//! - **JobBroker**: queue abstraction with a Redis implementation using
//!   BRPOPLPUSH and an in-process implementation with the same semantics
//! - **WorkerPool**: fixed set of workers draining the broker, one job each
//! - **RetryPolicy**: exponential backoff for retryable failures
//! - **Watchdog**: reconciliation of jobs stuck in `processing`
//! - **JobObserver**: completion and failure listeners
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │    Intake    │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │  JobBroker   │◄──── Watchdog (requeue)
//!                      └──────┬───────┘
//!                             │
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use repo_verifier::scheduler::{JobQueue, RetryPolicy, WorkerPool, WorkerPoolConfig};
//! use std::sync::Arc;
//!
//! let broker = Arc::new(JobQueue::connect("redis://localhost:6379", "repo-verification").await?);
//! let mut pool = WorkerPool::new(
//!     WorkerPoolConfig::new(2),
//!     broker,
//!     reporter,
//!     pipeline,
//!     RetryPolicy::default(),
//! );
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic dequeue**: Uses BRPOPLPUSH to atomically move jobs to processing queue
//! - **Crash recovery**: Jobs in processing queue are automatically requeued on pool start
//! - **Dead letter queue**: Failed jobs after max attempts are moved to DLQ for analysis
//! - **Graceful shutdown**: Workers finish current jobs before stopping

pub mod job;
pub mod memory;
pub mod observer;
pub mod queue;
pub mod retry;
pub mod watchdog;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{Job, JobOutcome, JobStatus, DEFAULT_MAX_ATTEMPTS};
pub use memory::InMemoryJobQueue;
pub use observer::{ChannelObserver, JobEvent, JobObserver};
pub use queue::{JobBroker, JobQueue, QueueError, QueueHandle, QueueState, QueueStats, QueueStatus};
pub use retry::RetryPolicy;
pub use watchdog::{SweepReport, Watchdog, WatchdogConfig};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};

//! In-process job broker.
//!
//! Mirrors the Redis queue semantics (reliable dequeue, delayed retries,
//! dead letter, queue-level state) inside one process. Used by tests and by
//! single-node deployments that run intake and workers together.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::job::Job;
use super::queue::{JobBroker, QueueError, QueueHandle, QueueState, QueueStats, QueueStatus};

#[derive(Default)]
struct Inner {
    queue: VecDeque<Job>,
    processing: Vec<Job>,
    delayed: Vec<(Instant, Job)>,
    dead_letter: Vec<(Job, String)>,
    states: HashMap<Uuid, QueueStatus>,
    closed: bool,
}

impl Inner {
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, job) = self.delayed.remove(i);
                self.states.insert(
                    job.id,
                    QueueStatus {
                        state: QueueState::Waiting,
                        progress: 0,
                    },
                );
                self.queue.push_back(job);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }

    fn release(&mut self, job_id: Uuid) {
        if let Some(pos) = self.processing.iter().position(|j| j.id == job_id) {
            self.processing.remove(pos);
        }
    }
}

/// A [`JobBroker`] backed by process memory.
pub struct InMemoryJobQueue {
    queue_name: String,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new(queue_name: &str) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Makes every operation fail with [`QueueError::Unavailable`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Undoes [`close`](Self::close).
    pub fn reopen(&self) {
        self.lock().closed = false;
    }

    /// Jobs moved to the dead letter queue, with their error.
    pub fn dead_letters(&self) -> Vec<(Job, String)> {
        self.lock().dead_letter.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a panicking test thread; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self) -> Result<std::sync::MutexGuard<'_, Inner>, QueueError> {
        let inner = self.lock();
        if inner.closed {
            return Err(QueueError::Unavailable(format!(
                "queue '{}' is closed",
                self.queue_name
            )));
        }
        Ok(inner)
    }
}

#[async_trait]
impl JobBroker for InMemoryJobQueue {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.open().map(|_| ())
    }

    async fn enqueue(&self, job: Job) -> Result<QueueHandle, QueueError> {
        {
            let mut inner = self.open()?;
            inner.states.insert(
                job.id,
                QueueStatus {
                    state: QueueState::Waiting,
                    progress: 0,
                },
            );
            inner.queue.push_back(job.clone());
        }
        self.notify.notify_one();

        Ok(QueueHandle {
            job_id: job.id,
            queue_name: self.queue_name.clone(),
        })
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let wake_at = {
                let mut inner = self.open()?;
                let now = Instant::now();
                inner.promote_due(now);

                if let Some(job) = inner.queue.pop_front() {
                    inner.states.insert(
                        job.id,
                        QueueStatus {
                            state: QueueState::Active,
                            progress: 0,
                        },
                    );
                    inner.processing.push(job.clone());
                    return Ok(Some(job));
                }

                if now >= deadline {
                    return Ok(None);
                }

                inner.next_due().map_or(deadline, |due| due.min(deadline))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn schedule_retry(&self, job: Job, delay: Duration) -> Result<(), QueueError> {
        {
            let mut inner = self.open()?;
            inner.release(job.id);
            inner.states.insert(
                job.id,
                QueueStatus {
                    state: QueueState::Delayed,
                    progress: 0,
                },
            );
            inner.delayed.push((Instant::now() + delay, job));
        }
        // Wake a sleeping worker so it recomputes its wake-up time.
        self.notify.notify_one();
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, state: QueueState) -> Result<(), QueueError> {
        let mut inner = self.open()?;
        inner.release(job_id);
        inner.states.insert(
            job_id,
            QueueStatus {
                state,
                progress: 100,
            },
        );
        Ok(())
    }

    async fn dead_letter(&self, job: Job, error: &str) -> Result<(), QueueError> {
        let mut inner = self.open()?;
        inner.release(job.id);
        inner.states.insert(
            job.id,
            QueueStatus {
                state: QueueState::Failed,
                progress: 100,
            },
        );
        inner.dead_letter.push((job, error.to_string()));
        Ok(())
    }

    async fn discard(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.open()?.release(job_id);
        Ok(())
    }

    async fn set_progress(&self, job_id: Uuid, progress: u8) -> Result<(), QueueError> {
        let mut inner = self.open()?;
        inner.states.insert(
            job_id,
            QueueStatus {
                state: QueueState::Active,
                progress: progress.min(100),
            },
        );
        Ok(())
    }

    async fn status(&self, job_id: Uuid) -> Result<Option<QueueStatus>, QueueError> {
        Ok(self.open()?.states.get(&job_id).copied())
    }

    async fn recover_processing_jobs(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        {
            let mut inner = self.open()?;
            let held: Vec<Job> = inner.processing.drain(..).collect();
            for mut job in held {
                job.increment_attempts();
                if job.should_retry() {
                    inner.states.insert(
                        job.id,
                        QueueStatus {
                            state: QueueState::Waiting,
                            progress: 0,
                        },
                    );
                    inner.queue.push_back(job);
                    recovered += 1;
                } else {
                    inner.states.insert(
                        job.id,
                        QueueStatus {
                            state: QueueState::Failed,
                            progress: 100,
                        },
                    );
                    inner.dead_letter.push((
                        job,
                        "Recovered from processing queue after max attempts".to_string(),
                    ));
                }
            }
        }
        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let inner = self.open()?;
        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_jobs: inner.queue.len(),
            processing_jobs: inner.processing.len(),
            delayed_jobs: inner.delayed.len(),
            dead_letter_jobs: inner.dead_letter.len(),
        })
    }
}

//! Job lifecycle listeners.
//!
//! Observers are registered when the pool is built and called by the worker
//! that produced the event, after the outcome has been persisted.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The job reached `completed`.
    Completed {
        job_id: Uuid,
        submission_id: Uuid,
        passed: bool,
        reason: String,
    },
    /// The job reached terminal `failed`.
    Failed {
        job_id: Uuid,
        submission_id: Uuid,
        reason: String,
        attempts: u32,
    },
    /// The job will run again after `delay`.
    Retrying {
        job_id: Uuid,
        attempts: u32,
        delay: Duration,
        reason: String,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Completed { job_id, .. }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Retrying { job_id, .. } => *job_id,
        }
    }
}

/// Receives job lifecycle events. Methods must not block.
pub trait JobObserver: Send + Sync {
    fn on_completed(&self, _event: &JobEvent) {}

    fn on_failed(&self, _event: &JobEvent) {}

    fn on_retry(&self, _event: &JobEvent) {}
}

/// Forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelObserver {
    /// Creates the observer and the receiving end.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: &JobEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.tx.send(event.clone());
    }
}

impl JobObserver for ChannelObserver {
    fn on_completed(&self, event: &JobEvent) {
        self.forward(event);
    }

    fn on_failed(&self, event: &JobEvent) {
        self.forward(event);
    }

    fn on_retry(&self, event: &JobEvent) {
        self.forward(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_observer_forwards_events() {
        let (observer, mut rx) = ChannelObserver::new();
        let job_id = Uuid::new_v4();

        observer.on_retry(&JobEvent::Retrying {
            job_id,
            attempts: 1,
            delay: Duration::from_secs(2),
            reason: "timeout".to_string(),
        });
        observer.on_completed(&JobEvent::Completed {
            job_id,
            submission_id: Uuid::new_v4(),
            passed: true,
            reason: "Setup completed successfully".to_string(),
        });

        let first = rx.recv().await.expect("retry event");
        assert!(matches!(first, JobEvent::Retrying { attempts: 1, .. }));
        let second = rx.recv().await.expect("completed event");
        assert_eq!(second.job_id(), job_id);
    }

    #[test]
    fn test_send_after_receiver_dropped_is_ignored() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_failed(&JobEvent::Failed {
            job_id: Uuid::new_v4(),
            submission_id: Uuid::new_v4(),
            reason: "boom".to_string(),
            attempts: 3,
        });
    }
}

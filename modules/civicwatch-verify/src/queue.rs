//! In-process verification job queue.
//!
//! Ingestion enqueues one job per submitted report; workers drain the
//! receiver. Delivery is at-least-once (jobs are re-enqueued on transient
//! engine failure), so correctness rests on the claim CAS in the store, not
//! on the queue: a redelivered job for an already-decided report loses the
//! claim and no-ops.

use tokio::sync::mpsc;
use uuid::Uuid;

/// One unit of verification work. Ephemeral — lives only until the report
/// reaches a decision status.
#[derive(Debug, Clone)]
pub struct VerificationJob {
    pub report_id: Uuid,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl VerificationJob {
    pub fn new(report_id: Uuid) -> Self {
        Self { report_id, attempts: 0, last_error: None }
    }
}

/// Cloneable enqueue handle. The single receiver side goes to the worker
/// pool.
#[derive(Clone)]
pub struct VerificationQueue {
    tx: mpsc::UnboundedSender<VerificationJob>,
}

impl VerificationQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<VerificationJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a fresh job for a newly submitted report.
    pub fn enqueue(&self, report_id: Uuid) {
        // Send fails only when the worker pool is gone (shutdown); jobs are
        // then recovered later via the reclaim sweep.
        let _ = self.tx.send(VerificationJob::new(report_id));
    }

    /// Put a failed job back with its attempt count bumped.
    pub fn requeue(&self, mut job: VerificationJob, error: &str) {
        job.attempts += 1;
        job.last_error = Some(error.to_string());
        let _ = self.tx.send(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_drain() {
        let (queue, mut rx) = VerificationQueue::new();
        let id = Uuid::new_v4();
        queue.enqueue(id);

        let job = rx.recv().await.unwrap();
        assert_eq!(job.report_id, id);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn requeue_bumps_attempts_and_records_error() {
        let (queue, mut rx) = VerificationQueue::new();
        queue.enqueue(Uuid::new_v4());
        let job = rx.recv().await.unwrap();

        queue.requeue(job, "store unavailable");
        let retried = rx.recv().await.unwrap();
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.last_error.as_deref(), Some("store unavailable"));
    }
}

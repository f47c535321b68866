//! Background verification workers.
//!
//! Workers drain the shared job queue and drive the orchestrator. A lost
//! claim is a silent no-op; an engine-level failure (storage down, queries
//! failing before a flag could be committed) re-enqueues the job up to
//! `MAX_JOB_ATTEMPTS`. The reclaim loop sweeps expired leases back into the
//! queue so a crashed worker never strands a report in claimed limbo.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use civicwatch_common::VerifyError;

use crate::orchestrator::Verifier;
use crate::queue::{VerificationJob, VerificationQueue};
use crate::store::ReportStore;

/// Engine-level retries per job before giving up on it.
pub const MAX_JOB_ATTEMPTS: u32 = 3;

pub struct Worker {
    id: String,
    verifier: Arc<Verifier>,
    queue: VerificationQueue,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        verifier: Arc<Verifier>,
        queue: VerificationQueue,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { id: id.into(), verifier, queue, shutdown }
    }

    /// Drain jobs until shutdown. The receiver is shared across the pool;
    /// each worker holds the lock only while waiting for its next job.
    pub async fn run(mut self, rx: Arc<Mutex<mpsc::UnboundedReceiver<VerificationJob>>>) {
        info!(worker = %self.id, "verification worker started");
        loop {
            let job = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.changed() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                }
            };
            self.process(job).await;
        }
        info!(worker = %self.id, "verification worker stopped");
    }

    async fn process(&self, job: VerificationJob) {
        match self.verifier.verify_report(job.report_id, &self.id).await {
            Ok(outcome) => {
                debug!(worker = %self.id, report_id = %job.report_id, ?outcome, "job done");
            }
            Err(VerifyError::ConcurrentClaim) => {
                // Another worker owns it. Not an error, no retry.
                debug!(worker = %self.id, report_id = %job.report_id, "lost claim, skipping");
            }
            Err(VerifyError::NotFound(id)) => {
                warn!(worker = %self.id, report_id = %id, "job for unknown report dropped");
            }
            Err(e) => {
                if job.attempts + 1 < MAX_JOB_ATTEMPTS {
                    debug!(worker = %self.id, report_id = %job.report_id,
                        attempts = job.attempts + 1, error = %e, "re-enqueueing job");
                    self.queue.requeue(job, &e.to_string());
                } else {
                    // The orchestrator flags reports itself on AI/query
                    // exhaustion; landing here means even the flag commit
                    // failed. The reclaim sweep will retry later.
                    error!(worker = %self.id, report_id = %job.report_id, error = %e,
                        "job attempts exhausted, leaving report for reclaim");
                }
            }
        }
    }
}

/// Periodically release expired claims and put the reports back in the
/// queue. Runs until shutdown.
pub async fn reclaim_loop(
    store: Arc<dyn ReportStore>,
    queue: VerificationQueue,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match store.reclaim_expired(Utc::now()).await {
            Ok(reclaimed) => {
                if !reclaimed.is_empty() {
                    info!(count = reclaimed.len(), "reclaimed expired verification claims");
                }
                for report_id in reclaimed {
                    queue.enqueue(report_id);
                }
            }
            Err(e) => warn!(error = %e, "reclaim sweep failed"),
        }
    }
}

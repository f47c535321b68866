use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use civicwatch_common::Config;
use civicwatch_store::{migrate, PgReportStore};
use civicwatch_verify::dedup::{DedupConfig, DuplicateDetector};
use civicwatch_verify::orchestrator::{LogObserver, Verifier, VerifierConfig};
use civicwatch_verify::store::ReportStore;
use civicwatch_verify::worker::reclaim_loop;
use civicwatch_verify::{VerificationQueue, Worker};
use vision_client::{
    BreakerConfig, CircuitBreaker, HttpVisionClient, ResilientClassifier, RetryPolicy,
    VisionClassifier,
};

/// How many unclaimed pending reports each intake poll pulls in.
const INTAKE_BATCH: i64 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("civicwatch=info".parse()?))
        .init();

    info!("CivicWatch verifier starting...");

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(config.worker_count as u32 + 2)
        .connect(&config.database_url)
        .await?;
    migrate(&pool).await?;

    let pg_store = PgReportStore::new(pool);
    let store: Arc<dyn ReportStore> = Arc::new(pg_store.clone());

    let classifier: Arc<dyn VisionClassifier> = Arc::new(ResilientClassifier::new(
        HttpVisionClient::new(&config.vision_api_url, &config.vision_api_key),
        Arc::new(CircuitBreaker::new(BreakerConfig::default())),
        RetryPolicy::default(),
    ));

    let detector = DuplicateDetector::new(store.clone(), DedupConfig::default());
    let verifier = Arc::new(Verifier::new(
        store.clone(),
        classifier,
        detector,
        Arc::new(LogObserver),
        VerifierConfig::default(),
    ));

    let (queue, rx) = VerificationQueue::new();
    let rx = Arc::new(Mutex::new(rx));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    for worker_id in 0..config.worker_count {
        let worker = Worker::new(
            format!("worker-{worker_id}"),
            verifier.clone(),
            queue.clone(),
            shutdown_rx.clone(),
        );
        handles.push(tokio::spawn(worker.run(rx.clone())));
    }

    let interval = Duration::from_secs(config.reclaim_interval_secs);
    handles.push(tokio::spawn(reclaim_loop(
        store,
        queue.clone(),
        interval,
        shutdown_rx.clone(),
    )));
    handles.push(tokio::spawn(intake_loop(
        pg_store,
        queue,
        interval,
        shutdown_rx,
    )));

    info!(workers = config.worker_count, "verification pool running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    info!("CivicWatch verifier stopped");
    Ok(())
}

/// Feed unclaimed pending reports into the queue. Runs until shutdown; the
/// claim CAS makes re-enqueueing an already-queued report a no-op.
async fn intake_loop(
    store: PgReportStore,
    queue: VerificationQueue,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match store.pending_unclaimed(INTAKE_BATCH).await {
            Ok(pending) => {
                if !pending.is_empty() {
                    info!(count = pending.len(), "queueing pending reports");
                }
                for report_id in pending {
                    queue.enqueue(report_id);
                }
            }
            Err(e) => warn!(error = %e, "pending report poll failed"),
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

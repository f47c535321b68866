//! Claim exclusivity, lease expiry and redelivery semantics.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use civicwatch_common::{IssueCategory, ReportStatus, TimelineEventKind, VerifyError};
use vision_client::VisionClassifier;

use civicwatch_verify::dedup::{DedupConfig, DuplicateDetector};
use civicwatch_verify::orchestrator::{flag_codes, Verifier, VerifierConfig, VerifyOutcome};
use civicwatch_verify::store::{Decision, ReportStore};
use civicwatch_verify::testing::{report_at, with_hash, MockClassifier, RecordingObserver, DELHI_PLAZA};
use civicwatch_verify::MemoryReportStore;

fn verifier_with(
    store: Arc<MemoryReportStore>,
    classifier: Arc<dyn VisionClassifier>,
    config: VerifierConfig,
) -> Verifier {
    let detector = DuplicateDetector::new(store.clone(), DedupConfig::default());
    Verifier::new(store, classifier, detector, Arc::new(RecordingObserver::new()), config)
}

#[tokio::test]
async fn exactly_one_of_two_concurrent_claims_wins() {
    let store = Arc::new(MemoryReportStore::new());
    let classifier = Arc::new(MockClassifier::always_valid(IssueCategory::Pothole, 6));
    let v = Arc::new(verifier_with(store.clone(), classifier.clone(), VerifierConfig::default()));

    let report = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xaaaa_0000_0000_0000);
    store.insert(report.clone()).await.unwrap();

    let (a, b) = tokio::join!(
        v.verify_report(report.id, "worker-a"),
        v.verify_report(report.id, "worker-b"),
    );

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one claimant may do the work");
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(VerifyError::ConcurrentClaim)));

    // The loser performed no verification work.
    assert_eq!(classifier.calls(), 1);
    let stored = store.fetch(report.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::Verified);
    let status_changes = stored
        .timeline
        .iter()
        .filter(|e| e.kind == TimelineEventKind::StatusChanged)
        .count();
    assert_eq!(status_changes, 1, "one decision, one commit");
}

#[tokio::test]
async fn redelivered_job_for_decided_report_is_a_noop() {
    let store = Arc::new(MemoryReportStore::new());
    let classifier = Arc::new(MockClassifier::always_valid(IssueCategory::Garbage, 3));
    let v = verifier_with(store.clone(), classifier.clone(), VerifierConfig::default());

    let report = with_hash(report_at(DELHI_PLAZA, IssueCategory::Garbage), 0xbbbb_0000_0000_0000);
    store.insert(report.clone()).await.unwrap();

    assert!(v.verify_report(report.id, "worker-1").await.is_ok());
    // At-least-once delivery redelivers the job; the claim CAS rejects it.
    let second = v.verify_report(report.id, "worker-1").await;
    assert!(matches!(second, Err(VerifyError::ConcurrentClaim)));
    assert_eq!(classifier.calls(), 1);
}

#[tokio::test]
async fn expired_lease_is_reclaimable() {
    let store = Arc::new(MemoryReportStore::new());
    let classifier = Arc::new(MockClassifier::always_valid(IssueCategory::Pothole, 5));
    let v = verifier_with(store.clone(), classifier.clone(), VerifierConfig::default());

    let report = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xcccc_0000_0000_0000);
    store.insert(report.clone()).await.unwrap();

    // A worker claims, then dies without committing.
    store
        .claim_for_verification(report.id, "doomed-worker", Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(store.claimed_by(report.id), Some("doomed-worker".to_string()));
    // While the lease is live, nobody else can claim.
    assert!(matches!(
        store
            .claim_for_verification(report.id, "worker-2", Duration::from_secs(60))
            .await,
        Err(VerifyError::ConcurrentClaim)
    ));

    tokio::time::sleep(Duration::from_millis(30)).await;
    let reclaimed = store.reclaim_expired(Utc::now()).await.unwrap();
    assert_eq!(reclaimed, vec![report.id]);
    assert_eq!(store.claimed_by(report.id), None);

    // The report is processable again and carries the reclaim audit event.
    let outcome = v.verify_report(report.id, "worker-2").await.unwrap();
    assert_eq!(outcome, VerifyOutcome::Verified);
    let stored = store.fetch(report.id).await.unwrap();
    assert!(stored
        .timeline
        .iter()
        .any(|e| e.kind == TimelineEventKind::ClaimReclaimed));
}

#[tokio::test]
async fn commit_after_losing_the_lease_is_rejected() {
    let store = Arc::new(MemoryReportStore::new());
    let report = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xabcd_0000_0000_0000);
    store.insert(report.clone()).await.unwrap();

    // worker-a claims, stalls past its lease, and the report is reclaimed
    // and handed to worker-b.
    store
        .claim_for_verification(report.id, "worker-a", Duration::from_millis(10))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    store.reclaim_expired(Utc::now()).await.unwrap();
    store
        .claim_for_verification(report.id, "worker-b", Duration::from_secs(60))
        .await
        .unwrap();

    let decision = || Decision {
        status: ReportStatus::Verified,
        duplicate_of: None,
        category: None,
        severity: None,
        events: vec![],
    };
    // worker-a wakes up and tries to commit with a dead lease.
    let late = store.commit_decision(report.id, "worker-a", decision()).await;
    assert!(matches!(late, Err(VerifyError::ConcurrentClaim)));
    let stored = store.fetch(report.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::PendingVerification);

    // The current holder commits fine.
    store.commit_decision(report.id, "worker-b", decision()).await.unwrap();
    assert_eq!(store.fetch(report.id).await.unwrap().status, ReportStatus::Verified);
}

#[tokio::test]
async fn transient_query_failures_are_retried_then_succeed() {
    let store = Arc::new(MemoryReportStore::new());
    let classifier = Arc::new(MockClassifier::always_valid(IssueCategory::Pothole, 5));
    let config = VerifierConfig {
        query_backoff: Duration::from_millis(1),
        ..VerifierConfig::default()
    };
    let v = verifier_with(store.clone(), classifier.clone(), config);

    let report = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xdddd_0000_0000_0000);
    store.insert(report.clone()).await.unwrap();

    store.fail_next_queries(2);
    let outcome = v.verify_report(report.id, "worker-1").await.unwrap();
    assert_eq!(outcome, VerifyOutcome::Verified);
}

#[tokio::test]
async fn exhausted_query_retries_flag_the_report() {
    let store = Arc::new(MemoryReportStore::new());
    let classifier = Arc::new(MockClassifier::always_valid(IssueCategory::Pothole, 5));
    let config = VerifierConfig {
        query_backoff: Duration::from_millis(1),
        ..VerifierConfig::default()
    };
    let v = verifier_with(store.clone(), classifier.clone(), config);

    let report = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xeeee_0000_0000_0000);
    store.insert(report.clone()).await.unwrap();

    store.fail_next_queries(100);
    let outcome = v.verify_report(report.id, "worker-1").await.unwrap();
    assert_eq!(outcome, VerifyOutcome::Flagged(flag_codes::VERIFICATION_ERROR));
    assert_eq!(classifier.calls(), 0, "no AI call when verification itself fails");

    let stored = store.fetch(report.id).await.unwrap();
    assert_eq!(stored.status, ReportStatus::Flagged);
}

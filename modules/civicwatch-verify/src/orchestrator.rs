//! The verification orchestrator: claims a pending report, runs duplicate
//! detection, conditionally pays for an AI classification call, and commits
//! exactly one decision status atomically with its timeline events.
//!
//! Failure policy (spec'd in `civicwatch_common::VerifyError` docs): lost
//! claims are silent no-ops, transient query failures retry with backoff,
//! and a definitive AI failure lands the report in `Flagged` — a terminal
//! state for automation, never a silent drop or an indefinite retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use civicwatch_common::{Report, ReportStatus, TimelineEvent, VerifyError};
use vision_client::{Classification, ImageRef, VisionClassifier, VisionError};

use crate::dedup::{DedupVerdict, DuplicateDetector};
use crate::store::{Decision, ReportStore};
use crate::transitions::transition_allowed;

/// Reason codes recorded on flagged reports. Review queues partition on
/// these; citizens only ever see the human-readable message.
pub mod flag_codes {
    pub const AI_UNAVAILABLE: &str = "ai_unavailable";
    pub const AI_REJECTED_REQUEST: &str = "ai_rejected_request";
    pub const VERIFICATION_ERROR: &str = "verification_error";
    pub const NO_IMAGE: &str = "no_image";
}

#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Claim lease; an abandoned claim becomes reclaimable after this.
    pub claim_lease: Duration,
    /// Attempts for candidate queries before flagging.
    pub query_attempts: u32,
    /// Base backoff between query attempts (doubles each time).
    pub query_backoff: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            claim_lease: Duration::from_secs(300),
            query_attempts: 3,
            query_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    Rejected,
    Duplicate(Uuid),
    Flagged(&'static str),
}

/// Observes committed status changes. The feed and notification layers hang
/// off this seam; a report is invisible publicly until its first change out
/// of `PendingVerification`.
#[async_trait]
pub trait StatusObserver: Send + Sync {
    async fn status_changed(&self, report_id: Uuid, from: ReportStatus, to: ReportStatus);
}

pub struct LogObserver;

#[async_trait]
impl StatusObserver for LogObserver {
    async fn status_changed(&self, report_id: Uuid, from: ReportStatus, to: ReportStatus) {
        info!(report_id = %report_id, from = %from, to = %to, "report status changed");
    }
}

pub struct Verifier {
    store: Arc<dyn ReportStore>,
    classifier: Arc<dyn VisionClassifier>,
    detector: DuplicateDetector,
    observer: Arc<dyn StatusObserver>,
    config: VerifierConfig,
}

impl Verifier {
    pub fn new(
        store: Arc<dyn ReportStore>,
        classifier: Arc<dyn VisionClassifier>,
        detector: DuplicateDetector,
        observer: Arc<dyn StatusObserver>,
        config: VerifierConfig,
    ) -> Self {
        Self { store, classifier, detector, observer, config }
    }

    /// Run the full verification pipeline for one report.
    ///
    /// Returns [`VerifyError::ConcurrentClaim`] when another worker owns the
    /// report — the caller treats that as a no-op, not a failure.
    pub async fn verify_report(
        &self,
        report_id: Uuid,
        claimant: &str,
    ) -> Result<VerifyOutcome, VerifyError> {
        self.store
            .claim_for_verification(report_id, claimant, self.config.claim_lease)
            .await?;
        let report = self.store.fetch(report_id).await?;
        debug!(report_id = %report_id, claimant, "claimed report for verification");

        // Duplicate check first — cheap, and avoids paying for an AI call.
        let mut verdict = match self.detect_with_retry(&report).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(report_id = %report_id, error = %e, "duplicate queries exhausted, flagging");
                return self
                    .flag(&report, claimant, flag_codes::VERIFICATION_ERROR, &format!("duplicate detection failed: {e}"))
                    .await;
            }
        };

        // The commit re-validates the target; if it was superseded between
        // detection and commit, detect again against the current candidate
        // set rather than linking to a dead report.
        while let DedupVerdict::Duplicate { matched_report_id, confidence, .. } = verdict {
            match self.commit_duplicate(&report, claimant, matched_report_id, confidence).await {
                Err(VerifyError::StaleDuplicateTarget(target)) => {
                    debug!(report_id = %report_id, target = %target,
                        "duplicate target superseded mid-commit, re-running detection");
                    verdict = match self.detect_with_retry(&report).await {
                        Ok(verdict) => verdict,
                        Err(e) => {
                            warn!(report_id = %report_id, error = %e, "duplicate queries exhausted, flagging");
                            return self
                                .flag(&report, claimant, flag_codes::VERIFICATION_ERROR, &format!("duplicate detection failed: {e}"))
                                .await;
                        }
                    };
                }
                other => return other,
            }
        }

        let Some(image) = report.images.first().map(|img| ImageRef::Url(img.url.clone())) else {
            return self
                .flag(&report, claimant, flag_codes::NO_IMAGE, "report has no classifiable image")
                .await;
        };

        match self.classifier.classify(&image).await {
            Ok(classification) if classification.is_valid_issue => {
                self.commit_verified(&report, claimant, classification).await
            }
            Ok(classification) => self.commit_rejected(&report, claimant, classification).await,
            Err(VisionError::CircuitOpen) => {
                self.flag(&report, claimant, flag_codes::AI_UNAVAILABLE, "AI service unavailable").await
            }
            Err(e @ VisionError::Transient(_)) => {
                warn!(report_id = %report_id, error = %e, "AI retries exhausted, flagging");
                self.flag(&report, claimant, flag_codes::AI_UNAVAILABLE, "AI service unavailable").await
            }
            Err(VisionError::Permanent { status, message }) => {
                warn!(report_id = %report_id, status, "AI rejected classification request");
                self.flag(
                    &report,
                    claimant,
                    flag_codes::AI_REJECTED_REQUEST,
                    &format!("classification request rejected ({status}): {message}"),
                )
                .await
            }
        }
    }

    async fn detect_with_retry(&self, report: &Report) -> Result<DedupVerdict, VerifyError> {
        let mut attempt = 0u32;
        loop {
            match self.detector.detect(report).await {
                Ok(verdict) => return Ok(verdict),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    if attempt >= self.config.query_attempts {
                        return Err(e);
                    }
                    let delay = self.config.query_backoff * 2u32.saturating_pow(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e,
                        "duplicate query failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn commit_duplicate(
        &self,
        report: &Report,
        claimant: &str,
        matched: Uuid,
        confidence: f64,
    ) -> Result<VerifyOutcome, VerifyError> {
        let to = ReportStatus::Duplicate;
        self.store
            .commit_decision(
                report.id,
                claimant,
                Decision {
                    status: to,
                    duplicate_of: Some(matched),
                    category: None,
                    severity: None,
                    events: vec![
                        TimelineEvent::duplicate_linked(matched, confidence),
                        TimelineEvent::status_changed(
                            report.status,
                            to,
                            "system",
                            "duplicate of an existing report",
                        ),
                    ],
                },
            )
            .await?;
        info!(report_id = %report.id, duplicate_of = %matched, confidence, "report marked duplicate");
        self.observer.status_changed(report.id, report.status, to).await;
        Ok(VerifyOutcome::Duplicate(matched))
    }

    async fn commit_verified(
        &self,
        report: &Report,
        claimant: &str,
        classification: Classification,
    ) -> Result<VerifyOutcome, VerifyError> {
        let to = ReportStatus::Verified;
        self.store
            .commit_decision(
                report.id,
                claimant,
                Decision {
                    status: to,
                    duplicate_of: None,
                    category: Some(classification.category),
                    severity: Some(classification.severity),
                    events: vec![
                        TimelineEvent::classification_recorded(
                            classification.category,
                            classification.severity,
                            classification.confidence,
                        ),
                        TimelineEvent::status_changed(
                            report.status,
                            to,
                            "system",
                            "classified as a valid civic issue",
                        ),
                    ],
                },
            )
            .await?;
        info!(report_id = %report.id, category = %classification.category,
            severity = classification.severity, "report verified");
        self.observer.status_changed(report.id, report.status, to).await;
        Ok(VerifyOutcome::Verified)
    }

    async fn commit_rejected(
        &self,
        report: &Report,
        claimant: &str,
        classification: Classification,
    ) -> Result<VerifyOutcome, VerifyError> {
        let to = ReportStatus::Rejected;
        self.store
            .commit_decision(
                report.id,
                claimant,
                Decision {
                    status: to,
                    duplicate_of: None,
                    category: None,
                    severity: None,
                    events: vec![
                        TimelineEvent::classification_recorded(
                            classification.category,
                            classification.severity,
                            classification.confidence,
                        ),
                        TimelineEvent::status_changed(
                            report.status,
                            to,
                            "system",
                            &classification.description,
                        ),
                    ],
                },
            )
            .await?;
        info!(report_id = %report.id, "report rejected by classification");
        self.observer.status_changed(report.id, report.status, to).await;
        Ok(VerifyOutcome::Rejected)
    }

    async fn flag(
        &self,
        report: &Report,
        claimant: &str,
        code: &'static str,
        message: &str,
    ) -> Result<VerifyOutcome, VerifyError> {
        let to = ReportStatus::Flagged;
        self.store
            .commit_decision(
                report.id,
                claimant,
                Decision {
                    status: to,
                    duplicate_of: None,
                    category: None,
                    severity: None,
                    events: vec![
                        TimelineEvent::flagged(code, message),
                        TimelineEvent::status_changed(report.status, to, "system", message),
                    ],
                },
            )
            .await?;
        info!(report_id = %report.id, code, "report flagged for human review");
        self.observer.status_changed(report.id, report.status, to).await;
        Ok(VerifyOutcome::Flagged(code))
    }

    // --- Manual transition primitives (moderator/citizen driven) ---

    pub async fn start_progress(&self, id: Uuid, actor: &str) -> Result<(), VerifyError> {
        self.manual_transition(id, ReportStatus::InProgress, actor, "work started").await
    }

    pub async fn resolve(&self, id: Uuid, actor: &str) -> Result<(), VerifyError> {
        self.manual_transition(id, ReportStatus::Resolved, actor, "issue resolved").await
    }

    pub async fn close(&self, id: Uuid, actor: &str) -> Result<(), VerifyError> {
        self.manual_transition(id, ReportStatus::Closed, actor, "resolution confirmed").await
    }

    pub async fn reopen(&self, id: Uuid, actor: &str) -> Result<(), VerifyError> {
        self.manual_transition(id, ReportStatus::InProgress, actor, "resolution disputed").await
    }

    /// Moderator verdict on a flagged report.
    pub async fn resolve_flag(&self, id: Uuid, valid: bool, actor: &str) -> Result<(), VerifyError> {
        let to = if valid { ReportStatus::Verified } else { ReportStatus::Rejected };
        self.manual_transition(id, to, actor, "flag reviewed").await
    }

    async fn manual_transition(
        &self,
        id: Uuid,
        to: ReportStatus,
        actor: &str,
        reason: &str,
    ) -> Result<(), VerifyError> {
        let report = self.store.fetch(id).await?;
        if !transition_allowed(report.status, to) {
            return Err(VerifyError::InvalidTransition { from: report.status, to });
        }
        self.store
            .apply_transition(
                id,
                report.status,
                to,
                TimelineEvent::status_changed(report.status, to, actor, reason),
            )
            .await?;
        info!(report_id = %id, from = %report.status, to = %to, actor, "manual transition");
        self.observer.status_changed(id, report.status, to).await;
        Ok(())
    }
}

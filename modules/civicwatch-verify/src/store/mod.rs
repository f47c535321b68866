//! Persistence seam for the verification engine.
//!
//! The engine never talks to a database directly; everything flows through
//! [`ReportStore`]. The contract carries the engine's atomicity needs:
//! claiming is a compare-and-swap, and a decision commits the status change
//! and its timeline event as one logical write. `MemoryReportStore`
//! implements the contract in-process for tests and local runs; the
//! Postgres implementation lives in the `civicwatch-store` crate.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use civicwatch_common::{
    IssueCategory, Report, ReportStatus, TimelineEvent, VerifyError,
};

/// The atomic outcome of a verification run, committed in one write.
#[derive(Debug, Clone)]
pub struct Decision {
    pub status: ReportStatus,
    /// Set only for `Duplicate` decisions. Write-once at the store level.
    pub duplicate_of: Option<Uuid>,
    /// Category refinement from classification, if any.
    pub category: Option<IssueCategory>,
    /// Severity refinement from classification, if any.
    pub severity: Option<u8>,
    /// Timeline events appended with the status change (at least the
    /// status-change event itself).
    pub events: Vec<TimelineEvent>,
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn fetch(&self, id: Uuid) -> Result<Report, VerifyError>;

    /// Persist a freshly submitted report (ingestion path).
    async fn insert(&self, report: Report) -> Result<(), VerifyError>;

    /// Atomically claim a report for verification: succeeds only if the
    /// report is still `PendingVerification` and either unclaimed or holding
    /// an expired lease. A losing claimant gets
    /// [`VerifyError::ConcurrentClaim`] and must do no work.
    async fn claim_for_verification(
        &self,
        id: Uuid,
        worker: &str,
        lease: Duration,
    ) -> Result<(), VerifyError>;

    /// Commit an automatic decision: status change + timeline append as one
    /// logical write, clearing the claim. Fails if the report is no longer
    /// `PendingVerification`, if `worker` no longer holds the claim
    /// ([`VerifyError::ConcurrentClaim`]), if `duplicate_of` was already
    /// set, or if the duplicate target has itself been superseded since
    /// detection ([`VerifyError::StaleDuplicateTarget`]). The target check
    /// runs inside the commit, so two reports can never end up marked as
    /// duplicates of each other.
    async fn commit_decision(
        &self,
        id: Uuid,
        worker: &str,
        decision: Decision,
    ) -> Result<(), VerifyError>;

    /// CAS for manual transitions: move from `expected` to `to` and append
    /// the event atomically. Fails with [`VerifyError::Storage`] if the
    /// current status is no longer `expected`.
    async fn apply_transition(
        &self,
        id: Uuid,
        expected: ReportStatus,
        to: ReportStatus,
        event: TimelineEvent,
    ) -> Result<(), VerifyError>;

    /// Reports sharing a perceptual-hash bucket, created at or after
    /// `since`. Candidate rows may omit timelines.
    async fn candidates_by_bucket(
        &self,
        bucket: u16,
        since: DateTime<Utc>,
    ) -> Result<Vec<Report>, VerifyError>;

    /// Same-category reports whose cell key is in `cells`, created at or
    /// after `since`, ordered most recent first.
    async fn candidates_by_cells(
        &self,
        cells: &[String],
        category: IssueCategory,
        since: DateTime<Utc>,
    ) -> Result<Vec<Report>, VerifyError>;

    /// Release expired claims on still-pending reports so abandoned jobs can
    /// be picked up again. Returns the ids that were reclaimed.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, VerifyError>;
}

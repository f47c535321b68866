//! In-memory [`ReportStore`]. Backs the engine tests and local runs with a
//! faithful implementation of the claim CAS and atomic-commit contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use civicwatch_common::{
    IssueCategory, Report, ReportStatus, TimelineEvent, VerifyError,
};

use crate::phash::DHash;
use crate::store::{Decision, ReportStore};

#[derive(Debug, Clone)]
struct Claim {
    worker: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Entry {
    report: Report,
    claim: Option<Claim>,
}

#[derive(Default)]
pub struct MemoryReportStore {
    entries: Mutex<HashMap<Uuid, Entry>>,
    /// When nonzero, the next N candidate queries fail with
    /// `DuplicateQuery` — exercises the orchestrator's query retry.
    fail_queries: AtomicU32,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` candidate queries fail transiently.
    pub fn fail_next_queries(&self, n: u32) {
        self.fail_queries.store(n, Ordering::SeqCst);
    }

    /// Current claim holder, if any (test inspection).
    pub fn claimed_by(&self, id: Uuid) -> Option<String> {
        let entries = self.entries.lock().expect("store lock poisoned");
        entries.get(&id).and_then(|e| e.claim.as_ref().map(|c| c.worker.clone()))
    }

    fn consume_query_fault(&self) -> Result<(), VerifyError> {
        let remaining = self.fail_queries.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .fail_queries
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(VerifyError::DuplicateQuery("injected query failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn fetch(&self, id: Uuid) -> Result<Report, VerifyError> {
        let entries = self.entries.lock().expect("store lock poisoned");
        entries
            .get(&id)
            .map(|e| e.report.clone())
            .ok_or(VerifyError::NotFound(id))
    }

    async fn insert(&self, report: Report) -> Result<(), VerifyError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(report.id, Entry { report, claim: None });
        Ok(())
    }

    async fn claim_for_verification(
        &self,
        id: Uuid,
        worker: &str,
        lease: Duration,
    ) -> Result<(), VerifyError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let entry = entries.get_mut(&id).ok_or(VerifyError::NotFound(id))?;

        if entry.report.status != ReportStatus::PendingVerification {
            return Err(VerifyError::ConcurrentClaim);
        }
        let now = Utc::now();
        if let Some(claim) = &entry.claim {
            if claim.expires_at > now {
                return Err(VerifyError::ConcurrentClaim);
            }
        }
        entry.claim = Some(Claim {
            worker: worker.to_string(),
            expires_at: now
                + chrono::Duration::from_std(lease)
                    .map_err(|e| VerifyError::Storage(e.to_string()))?,
        });
        Ok(())
    }

    async fn commit_decision(
        &self,
        id: Uuid,
        worker: &str,
        decision: Decision,
    ) -> Result<(), VerifyError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        if !entries.contains_key(&id) {
            return Err(VerifyError::NotFound(id));
        }
        // Commits serialize on the store lock, so checking the target here
        // closes the detect-to-commit window: the second of two symmetric
        // duplicate commits sees its target already superseded.
        if let Some(target) = decision.duplicate_of {
            let target_active = entries
                .get(&target)
                .is_some_and(|e| e.report.status.is_active());
            if !target_active {
                return Err(VerifyError::StaleDuplicateTarget(target));
            }
        }
        let entry = entries.get_mut(&id).ok_or(VerifyError::NotFound(id))?;

        if entry.report.status != ReportStatus::PendingVerification {
            return Err(VerifyError::Storage(format!(
                "report {id} already decided ({})",
                entry.report.status
            )));
        }
        if entry.claim.as_ref().map(|c| c.worker.as_str()) != Some(worker) {
            // The lease was reclaimed (or never held): the commit belongs to
            // whoever holds the claim now.
            return Err(VerifyError::ConcurrentClaim);
        }
        if decision.duplicate_of.is_some() && entry.report.duplicate_of.is_some() {
            return Err(VerifyError::Storage(format!(
                "duplicate_of is write-once for report {id}"
            )));
        }

        entry.report.status = decision.status;
        if let Some(target) = decision.duplicate_of {
            entry.report.duplicate_of = Some(target);
        }
        if let Some(category) = decision.category {
            entry.report.category = category;
        }
        if let Some(severity) = decision.severity {
            entry.report.severity = severity.clamp(1, 10);
        }
        entry.report.timeline.extend(decision.events);
        entry.claim = None;
        Ok(())
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        expected: ReportStatus,
        to: ReportStatus,
        event: TimelineEvent,
    ) -> Result<(), VerifyError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let entry = entries.get_mut(&id).ok_or(VerifyError::NotFound(id))?;

        if entry.report.status != expected {
            return Err(VerifyError::Storage(format!(
                "report {id} moved from {expected} to {} concurrently",
                entry.report.status
            )));
        }
        entry.report.status = to;
        entry.report.timeline.push(event);
        Ok(())
    }

    async fn candidates_by_bucket(
        &self,
        bucket: u16,
        since: DateTime<Utc>,
    ) -> Result<Vec<Report>, VerifyError> {
        self.consume_query_fault()?;
        let entries = self.entries.lock().expect("store lock poisoned");
        let mut matches: Vec<Report> = entries
            .values()
            .filter(|e| e.report.created_at >= since)
            .filter(|e| {
                e.report.images.iter().any(|img| {
                    img.perceptual_hash
                        .is_some_and(|h| DHash(h).bucket() == bucket)
                })
            })
            .map(|e| e.report.clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    async fn candidates_by_cells(
        &self,
        cells: &[String],
        category: IssueCategory,
        since: DateTime<Utc>,
    ) -> Result<Vec<Report>, VerifyError> {
        self.consume_query_fault()?;
        let entries = self.entries.lock().expect("store lock poisoned");
        let mut matches: Vec<Report> = entries
            .values()
            .filter(|e| {
                e.report.category == category
                    && e.report.created_at >= since
                    && cells.contains(&e.report.geohash)
            })
            .map(|e| e.report.clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matches)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, VerifyError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let mut reclaimed = Vec::new();
        for entry in entries.values_mut() {
            if entry.report.status != ReportStatus::PendingVerification {
                continue;
            }
            let expired = entry.claim.as_ref().is_some_and(|c| c.expires_at <= now);
            if expired {
                let previous = entry.claim.take().map(|c| c.worker).unwrap_or_default();
                entry
                    .report
                    .timeline
                    .push(TimelineEvent::claim_reclaimed(&previous));
                reclaimed.push(entry.report.id);
            }
        }
        Ok(reclaimed)
    }
}

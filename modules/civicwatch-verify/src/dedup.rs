//! Two-path duplicate detection.
//!
//! The hash path runs first and carries the most confidence: a small
//! Hamming distance between perceptual hashes means two photos of the same
//! scene. Only when it finds nothing does the geo path run: same category,
//! close in space and recent in time is suggestive but weaker evidence, so
//! it gets a flat, lower confidence. Both paths skip candidates whose
//! status is no longer active, so duplicate chains never point at
//! rejected, superseded or resolved reports.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use civicwatch_common::{haversine_m, Report, VerifyError};

use crate::geo::{cell_with_neighbors, DEFAULT_PROXIMITY_RADIUS_M};
use crate::phash::{DHash, DEFAULT_SIMILARITY_THRESHOLD, DHASH_BITS};
use crate::store::ReportStore;

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Max Hamming distance (of 64 bits) still considered the same scene.
    pub hamming_threshold: u32,
    /// Lookback window for the hash path. Longer than the proximity window:
    /// a visual match is strong evidence regardless of submission gap.
    pub hash_window: Duration,
    /// Lookback window for the proximity path.
    pub proximity_window: Duration,
    /// Haversine cutoff for proximity candidates, in meters. The 3x3 cell
    /// block used for retrieval spans ~450m; this trims it to the radius
    /// the product intends.
    pub proximity_radius_m: f64,
    /// Confidence assigned to proximity-only matches.
    pub proximity_confidence: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            hamming_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            hash_window: Duration::hours(72),
            proximity_window: Duration::hours(24),
            proximity_radius_m: DEFAULT_PROXIMITY_RADIUS_M,
            proximity_confidence: 0.60,
        }
    }
}

/// Tagged verdict: "no match" is unambiguous from "match not yet computed".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum DedupVerdict {
    NotDuplicate,
    Duplicate {
        matched_report_id: Uuid,
        confidence: f64,
        /// Present for hash-path matches only.
        hamming_distance: Option<u32>,
    },
}

pub struct DuplicateDetector {
    store: Arc<dyn ReportStore>,
    config: DedupConfig,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn ReportStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    /// Deterministic and idempotent: the same report against the same
    /// candidate set always yields the same verdict.
    pub async fn detect(&self, report: &Report) -> Result<DedupVerdict, VerifyError> {
        if let Some(verdict) = self.hash_match(report).await? {
            return Ok(verdict);
        }
        if let Some(verdict) = self.proximity_match(report).await? {
            return Ok(verdict);
        }
        Ok(DedupVerdict::NotDuplicate)
    }

    async fn hash_match(&self, report: &Report) -> Result<Option<DedupVerdict>, VerifyError> {
        let since = report.created_at - self.config.hash_window;
        // Best match: smallest Hamming distance, ties broken by recency.
        let mut best: Option<(Uuid, u32, chrono::DateTime<chrono::Utc>)> = None;

        for hash in report.images.iter().filter_map(|img| img.perceptual_hash) {
            let hash = DHash(hash);
            let candidates = self.store.candidates_by_bucket(hash.bucket(), since).await?;
            for candidate in &candidates {
                if candidate.id == report.id || !candidate.status.is_active() {
                    continue;
                }
                for candidate_hash in candidate.images.iter().filter_map(|img| img.perceptual_hash)
                {
                    let distance = hash.hamming_distance(DHash(candidate_hash));
                    if distance > self.config.hamming_threshold {
                        continue;
                    }
                    let better = match &best {
                        None => true,
                        Some((_, best_distance, best_created)) => {
                            distance < *best_distance
                                || (distance == *best_distance
                                    && candidate.created_at > *best_created)
                        }
                    };
                    if better {
                        best = Some((candidate.id, distance, candidate.created_at));
                    }
                }
            }
        }

        Ok(best.map(|(id, distance, _)| {
            let confidence = 1.0 - f64::from(distance) / f64::from(DHASH_BITS);
            debug!(matched = %id, distance, confidence, "hash-path duplicate");
            DedupVerdict::Duplicate {
                matched_report_id: id,
                confidence,
                hamming_distance: Some(distance),
            }
        }))
    }

    async fn proximity_match(&self, report: &Report) -> Result<Option<DedupVerdict>, VerifyError> {
        let since = report.created_at - self.config.proximity_window;
        let cells = cell_with_neighbors(&report.geohash);
        let candidates = self
            .store
            .candidates_by_cells(&cells, report.category, since)
            .await?;

        // Candidates come most-recent-first; the first active one inside the
        // radius is the match.
        let matched = candidates.iter().find(|candidate| {
            candidate.id != report.id
                && candidate.status.is_active()
                && haversine_m(
                    report.location.lat,
                    report.location.lng,
                    candidate.location.lat,
                    candidate.location.lng,
                ) <= self.config.proximity_radius_m
        });

        Ok(matched.map(|candidate| {
            debug!(matched = %candidate.id, "proximity-path duplicate");
            DedupVerdict::Duplicate {
                matched_report_id: candidate.id,
                confidence: self.config.proximity_confidence,
                hamming_distance: None,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use civicwatch_common::{IssueCategory, ReportStatus};

    use super::*;
    use crate::store::memory::MemoryReportStore;
    use crate::testing::{report_at, with_hash, DELHI_PLAZA};

    fn detector(store: Arc<MemoryReportStore>) -> DuplicateDetector {
        DuplicateDetector::new(store, DedupConfig::default())
    }

    #[tokio::test]
    async fn fresh_report_is_not_duplicate() {
        let store = Arc::new(MemoryReportStore::new());
        let report = report_at(DELHI_PLAZA, IssueCategory::Pothole);
        store.insert(report.clone()).await.unwrap();

        let verdict = detector(store).detect(&report).await.unwrap();
        assert_eq!(verdict, DedupVerdict::NotDuplicate);
    }

    #[tokio::test]
    async fn close_hash_match_wins_with_distance() {
        let store = Arc::new(MemoryReportStore::new());
        let existing = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xff00_ff00_ff00_ff00);
        store.insert(existing.clone()).await.unwrap();

        // Three bits flipped from the existing hash.
        let new = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xff00_ff00_ff00_ff07);
        store.insert(new.clone()).await.unwrap();

        match detector(store).detect(&new).await.unwrap() {
            DedupVerdict::Duplicate { matched_report_id, hamming_distance, confidence } => {
                assert_eq!(matched_report_id, existing.id);
                assert_eq!(hamming_distance, Some(3));
                assert!(confidence > 0.9);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn distant_hash_is_not_a_match() {
        let store = Arc::new(MemoryReportStore::new());
        // Same bucket (top 16 bits), but 32 low bits differ.
        let existing = with_hash(
            report_at((28.95, 77.40), IssueCategory::Pothole),
            0xabcd_0000_0000_0000,
        );
        store.insert(existing).await.unwrap();

        let new = with_hash(
            report_at((28.95, 77.40), IssueCategory::Garbage),
            0xabcd_0000_ffff_ffff,
        );
        store.insert(new.clone()).await.unwrap();

        // Different category too, so the proximity path can't match either.
        let verdict = detector(store).detect(&new).await.unwrap();
        assert_eq!(verdict, DedupVerdict::NotDuplicate);
    }

    #[tokio::test]
    async fn tie_break_prefers_smaller_distance() {
        let store = Arc::new(MemoryReportStore::new());
        let far = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xff00_0000_0000_00ff);
        let near = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xff00_0000_0000_0001);
        store.insert(far.clone()).await.unwrap();
        store.insert(near.clone()).await.unwrap();

        let new = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xff00_0000_0000_0000);
        store.insert(new.clone()).await.unwrap();

        match detector(store).detect(&new).await.unwrap() {
            DedupVerdict::Duplicate { matched_report_id, .. } => {
                assert_eq!(matched_report_id, near.id);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn inactive_candidates_are_skipped() {
        let store = Arc::new(MemoryReportStore::new());
        let mut rejected = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0x1234_0000_0000_0000);
        rejected.status = ReportStatus::Rejected;
        store.insert(rejected).await.unwrap();

        let new = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0x1234_0000_0000_0000);
        store.insert(new.clone()).await.unwrap();

        // Identical hash, but the only candidate is rejected. The proximity
        // path also skips it, so the verdict is clean.
        let verdict = detector(store).detect(&new).await.unwrap();
        assert_eq!(verdict, DedupVerdict::NotDuplicate);
    }

    #[tokio::test]
    async fn nearby_same_category_matches_by_proximity() {
        let store = Arc::new(MemoryReportStore::new());
        let existing = report_at(DELHI_PLAZA, IssueCategory::Garbage);
        store.insert(existing.clone()).await.unwrap();

        // ~55m north, no images in common (no hashes at all).
        let new = report_at((DELHI_PLAZA.0 + 0.0005, DELHI_PLAZA.1), IssueCategory::Garbage);
        store.insert(new.clone()).await.unwrap();

        match detector(store).detect(&new).await.unwrap() {
            DedupVerdict::Duplicate { matched_report_id, confidence, hamming_distance } => {
                assert_eq!(matched_report_id, existing.id);
                assert_eq!(confidence, 0.60);
                assert_eq!(hamming_distance, None);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_hundred_meters_apart_is_not_a_duplicate() {
        let store = Arc::new(MemoryReportStore::new());
        let existing = report_at(DELHI_PLAZA, IssueCategory::Pothole);
        store.insert(existing).await.unwrap();

        // ~200m north: possibly in the neighbor cell set, but past the
        // haversine cutoff.
        let new = report_at((DELHI_PLAZA.0 + 0.0018, DELHI_PLAZA.1), IssueCategory::Pothole);
        store.insert(new.clone()).await.unwrap();

        let verdict = detector(store).detect(&new).await.unwrap();
        assert_eq!(verdict, DedupVerdict::NotDuplicate);
    }

    #[tokio::test]
    async fn category_mismatch_blocks_proximity_path() {
        let store = Arc::new(MemoryReportStore::new());
        let existing = report_at(DELHI_PLAZA, IssueCategory::Garbage);
        store.insert(existing).await.unwrap();

        let new = report_at(DELHI_PLAZA, IssueCategory::Pothole);
        store.insert(new.clone()).await.unwrap();

        let verdict = detector(store).detect(&new).await.unwrap();
        assert_eq!(verdict, DedupVerdict::NotDuplicate);
    }

    #[tokio::test]
    async fn detection_is_idempotent() {
        let store = Arc::new(MemoryReportStore::new());
        let existing = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xaaaa_0000_0000_0000);
        store.insert(existing).await.unwrap();
        let new = with_hash(report_at(DELHI_PLAZA, IssueCategory::Pothole), 0xaaaa_0000_0000_0001);
        store.insert(new.clone()).await.unwrap();

        let detector = detector(store);
        let first = detector.detect(&new).await.unwrap();
        let second = detector.detect(&new).await.unwrap();
        assert_eq!(first, second);
    }
}

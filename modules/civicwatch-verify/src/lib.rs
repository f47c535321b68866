//! Verification and duplicate-detection engine.
//!
//! A citizen report enters as `PendingVerification` and leaves with exactly
//! one automatic decision: `Verified`, `Rejected`, `Duplicate` or `Flagged`.
//! The pipeline: claim the report (CAS, at-most-one worker), check for
//! duplicates (perceptual hash bucket first, geo proximity second), then —
//! only if clear — pay for an AI classification call. Every decision commits
//! atomically with its audit-timeline event through the [`store::ReportStore`]
//! seam.

pub mod dedup;
pub mod geo;
pub mod orchestrator;
pub mod phash;
pub mod queue;
pub mod store;
pub mod testing;
pub mod transitions;
pub mod worker;

pub use dedup::{DedupConfig, DedupVerdict, DuplicateDetector};
pub use orchestrator::{LogObserver, StatusObserver, Verifier, VerifierConfig, VerifyOutcome};
pub use phash::DHash;
pub use queue::{VerificationJob, VerificationQueue};
pub use store::{memory::MemoryReportStore, Decision, ReportStore};
pub use worker::Worker;

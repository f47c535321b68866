use thiserror::Error;
use uuid::Uuid;

use crate::types::ReportStatus;

/// Error taxonomy for the verification engine.
///
/// The distinctions matter for policy: transient AI and query failures are
/// retried with bounded backoff; permanent and open-breaker failures
/// short-circuit the report to `Flagged`; a lost claim race is a no-op.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Timeout, 5xx or connection failure from the vision service. Retryable.
    #[error("transient AI failure: {0}")]
    TransientAi(String),

    /// Non-rate-limit 4xx from the vision service. Not retryable.
    #[error("permanent AI failure: {0}")]
    PermanentAi(String),

    /// The vision circuit breaker is open. Fail fast, no local retry.
    #[error("AI circuit breaker is open")]
    CircuitOpen,

    /// Corrupt or unsupported image bytes. Non-fatal: hashing is skipped.
    #[error("image decode failed: {0}")]
    ImageDecode(String),

    /// Candidate query against the persistence layer failed. Retried, then
    /// surfaced.
    #[error("duplicate candidate query failed: {0}")]
    DuplicateQuery(String),

    /// Another worker already owns the verification claim. A no-op for the
    /// loser, never reported upward as a failure.
    #[error("report already claimed by another worker")]
    ConcurrentClaim,

    /// The duplicate match target was superseded between detection and
    /// commit. The orchestrator re-runs detection instead of linking to a
    /// dead report.
    #[error("duplicate target {0} is no longer active")]
    StaleDuplicateTarget(Uuid),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: ReportStatus, to: ReportStatus },

    #[error("coordinates outside valid range: {0}")]
    InvalidLocation(String),

    #[error("report not found: {0}")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl VerifyError {
    /// Whether the orchestrator should retry locally before giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, VerifyError::TransientAi(_) | VerifyError::DuplicateQuery(_))
    }
}

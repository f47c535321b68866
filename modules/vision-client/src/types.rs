use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use civicwatch_common::IssueCategory;

/// Structured verdict from the vision service for one report image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Classification {
    /// Whether the image shows a real, actionable civic issue.
    pub is_valid_issue: bool,
    pub category: IssueCategory,
    /// 1..=10. Clamped on ingestion; out-of-range model output is not an error.
    pub severity: u8,
    /// Human-readable description; doubles as the rejection reason when
    /// `is_valid_issue` is false.
    pub description: String,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
}

impl Classification {
    /// Normalize model output: clamp severity into the domain range.
    pub fn normalized(mut self) -> Self {
        self.severity = self.severity.clamp(1, 10);
        self.confidence = self.confidence.clamp(0.0, 1.0);
        self
    }
}

/// An image handed to the classifier: either a fetchable reference or the
/// raw bytes themselves (sent base64-encoded).
#[derive(Debug, Clone, PartialEq)]
pub enum ImageRef {
    Url(String),
    Bytes(Vec<u8>),
}

#[derive(Error, Debug)]
pub enum VisionError {
    /// Timeout, connection failure, 429 or 5xx. Eligible for retry.
    #[error("transient vision service failure: {0}")]
    Transient(String),

    /// The service rejected the request (non-rate-limit 4xx, or an
    /// undecodable success body). Retrying will not help.
    #[error("vision service rejected request ({status}): {message}")]
    Permanent { status: u16, message: String },

    /// The circuit breaker is open; no call was attempted.
    #[error("vision circuit breaker is open")]
    CircuitOpen,
}

impl VisionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VisionError::Transient(_))
    }
}

// Test doubles for the verification engine.
//
// Mocks sit at the two trait boundaries:
// - MockClassifier (VisionClassifier) — scripted results plus an invocation
//   counter, so tests can assert "no AI call was made".
// - RecordingObserver (StatusObserver) — captures committed transitions.
//
// Plus builders for reports at known Delhi coordinates. MemoryReportStore
// (`store::memory`) is the in-memory store side of the harness.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use civicwatch_common::{GeoPoint, IssueCategory, Report, ReportImage, ReportStatus};
use vision_client::{Classification, ImageRef, VisionClassifier, VisionError};

use crate::geo::encode_cell;
use crate::orchestrator::StatusObserver;

/// Connaught-area plaza, Delhi.
pub const DELHI_PLAZA: (f64, f64) = (28.70, 77.10);

/// A pending report at the given coordinates with no images attached.
pub fn report_at(location: (f64, f64), category: IssueCategory) -> Report {
    let (lat, lng) = location;
    let geohash = encode_cell(lat, lng).expect("test coordinates in range");
    Report::new(None, Vec::new(), GeoPoint { lat, lng }, geohash, category, 5)
}

/// Attach an image carrying the given perceptual hash.
pub fn with_hash(mut report: Report, hash: u64) -> Report {
    let n = report.images.len();
    report.images.push(ReportImage {
        url: format!("http://images.test/{}/{n}.jpg", report.id),
        content_hash: format!("sha256:{:016x}", hash ^ report.id.as_u128() as u64),
        perceptual_hash: Some(hash),
    });
    report
}

pub fn classification(category: IssueCategory, severity: u8) -> Classification {
    Classification {
        is_valid_issue: true,
        category,
        severity,
        description: format!("{category} visible in image"),
        confidence: 0.9,
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ScriptedFailure {
    Transient,
    Permanent,
}

impl ScriptedFailure {
    fn to_error(self) -> VisionError {
        match self {
            ScriptedFailure::Transient => VisionError::Transient("scripted timeout".into()),
            ScriptedFailure::Permanent => {
                VisionError::Permanent { status: 400, message: "scripted rejection".into() }
            }
        }
    }
}

/// Scripted classifier. Pops scripted results first, then falls back to the
/// configured steady-state behavior. Counts invocations.
pub struct MockClassifier {
    script: Mutex<Vec<Result<Classification, ScriptedFailure>>>,
    fallback: Result<Classification, ScriptedFailure>,
    calls: AtomicU32,
}

impl MockClassifier {
    pub fn always(classification: Classification) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback: Ok(classification),
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_valid(category: IssueCategory, severity: u8) -> Self {
        Self::always(classification(category, severity))
    }

    pub fn always_invalid(description: &str) -> Self {
        Self::always(Classification {
            is_valid_issue: false,
            category: IssueCategory::Other,
            severity: 1,
            description: description.to_string(),
            confidence: 0.85,
        })
    }

    /// Every call times out — the flaky-service harness.
    pub fn always_timing_out() -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback: Err(ScriptedFailure::Transient),
            calls: AtomicU32::new(0),
        }
    }

    pub fn always_rejecting_requests() -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            fallback: Err(ScriptedFailure::Permanent),
            calls: AtomicU32::new(0),
        }
    }

    /// Queue a one-shot scripted result ahead of the fallback.
    pub fn then(self, result: Result<Classification, ScriptedFailure>) -> Self {
        self.script.lock().unwrap().push(result);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VisionClassifier for MockClassifier {
    async fn classify(&self, _image: &ImageRef) -> Result<Classification, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() { None } else { Some(script.remove(0)) }
        };
        match scripted.unwrap_or_else(|| self.fallback.clone()) {
            Ok(classification) => Ok(classification),
            Err(failure) => Err(failure.to_error()),
        }
    }
}

/// Captures every committed status change for assertions.
#[derive(Default)]
pub struct RecordingObserver {
    transitions: Mutex<Vec<(Uuid, ReportStatus, ReportStatus)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<(Uuid, ReportStatus, ReportStatus)> {
        self.transitions.lock().unwrap().clone()
    }
}

#[async_trait]
impl StatusObserver for RecordingObserver {
    async fn status_changed(&self, report_id: Uuid, from: ReportStatus, to: ReportStatus) {
        self.transitions.lock().unwrap().push((report_id, from, to));
    }
}

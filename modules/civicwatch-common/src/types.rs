use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Geo Types ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Haversine great-circle distance between two lat/lng points in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let lat1_r = lat1.to_radians();
    let lat2_r = lat2.to_radians();

    let a = (d_lat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_M * c
}

// --- Enums ---

/// Lifecycle status of a report. Only the verification engine performs the
/// automatic transitions out of `PendingVerification`; the later transitions
/// are moderator/citizen driven and exposed as checked primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    PendingVerification,
    Verified,
    Rejected,
    Duplicate,
    Flagged,
    InProgress,
    Resolved,
    Closed,
}

impl ReportStatus {
    /// Whether a report in this status is still a live civic issue, and so
    /// eligible as a duplicate-match target. Rejected, duplicate, flagged,
    /// resolved and closed reports are superseded; matching against them
    /// would create duplicate chains pointing at dead reports.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ReportStatus::PendingVerification | ReportStatus::Verified | ReportStatus::InProgress
        )
    }

    /// Whether this is one of the automatic decision statuses the engine
    /// resolves a pending report into.
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            ReportStatus::Verified
                | ReportStatus::Rejected
                | ReportStatus::Duplicate
                | ReportStatus::Flagged
        )
    }
}

impl std::fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportStatus::PendingVerification => write!(f, "pending_verification"),
            ReportStatus::Verified => write!(f, "verified"),
            ReportStatus::Rejected => write!(f, "rejected"),
            ReportStatus::Duplicate => write!(f, "duplicate"),
            ReportStatus::Flagged => write!(f, "flagged"),
            ReportStatus::InProgress => write!(f, "in_progress"),
            ReportStatus::Resolved => write!(f, "resolved"),
            ReportStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for ReportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_verification" => Ok(ReportStatus::PendingVerification),
            "verified" => Ok(ReportStatus::Verified),
            "rejected" => Ok(ReportStatus::Rejected),
            "duplicate" => Ok(ReportStatus::Duplicate),
            "flagged" => Ok(ReportStatus::Flagged),
            "in_progress" => Ok(ReportStatus::InProgress),
            "resolved" => Ok(ReportStatus::Resolved),
            "closed" => Ok(ReportStatus::Closed),
            other => Err(format!("unknown report status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    Pothole,
    Garbage,
    Streetlight,
    WaterLeak,
    Sewage,
    RoadDamage,
    TreeFall,
    Encroachment,
    StrayAnimals,
    Other,
}

impl IssueCategory {
    /// Parse a free-text category label (as returned by the vision service)
    /// into a known category. Unknown labels fold into `Other`.
    pub fn parse_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "pothole" | "potholes" => IssueCategory::Pothole,
            "garbage" | "trash" | "litter" => IssueCategory::Garbage,
            "streetlight" | "street_light" | "broken_streetlight" => IssueCategory::Streetlight,
            "water_leak" | "waterleak" | "water leakage" => IssueCategory::WaterLeak,
            "sewage" | "open_drain" => IssueCategory::Sewage,
            "road_damage" | "broken_road" => IssueCategory::RoadDamage,
            "tree_fall" | "fallen_tree" => IssueCategory::TreeFall,
            "encroachment" => IssueCategory::Encroachment,
            "stray_animals" | "stray_animal" => IssueCategory::StrayAnimals,
            _ => IssueCategory::Other,
        }
    }
}

impl std::fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IssueCategory::Pothole => write!(f, "pothole"),
            IssueCategory::Garbage => write!(f, "garbage"),
            IssueCategory::Streetlight => write!(f, "streetlight"),
            IssueCategory::WaterLeak => write!(f, "water_leak"),
            IssueCategory::Sewage => write!(f, "sewage"),
            IssueCategory::RoadDamage => write!(f, "road_damage"),
            IssueCategory::TreeFall => write!(f, "tree_fall"),
            IssueCategory::Encroachment => write!(f, "encroachment"),
            IssueCategory::StrayAnimals => write!(f, "stray_animals"),
            IssueCategory::Other => write!(f, "other"),
        }
    }
}

// --- Timeline ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventKind {
    Submitted,
    StatusChanged,
    DuplicateLinked,
    ClassificationRecorded,
    FlaggedForReview,
    ClaimReclaimed,
}

impl std::fmt::Display for TimelineEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimelineEventKind::Submitted => write!(f, "submitted"),
            TimelineEventKind::StatusChanged => write!(f, "status_changed"),
            TimelineEventKind::DuplicateLinked => write!(f, "duplicate_linked"),
            TimelineEventKind::ClassificationRecorded => write!(f, "classification_recorded"),
            TimelineEventKind::FlaggedForReview => write!(f, "flagged_for_review"),
            TimelineEventKind::ClaimReclaimed => write!(f, "claim_reclaimed"),
        }
    }
}

impl std::str::FromStr for TimelineEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(TimelineEventKind::Submitted),
            "status_changed" => Ok(TimelineEventKind::StatusChanged),
            "duplicate_linked" => Ok(TimelineEventKind::DuplicateLinked),
            "classification_recorded" => Ok(TimelineEventKind::ClassificationRecorded),
            "flagged_for_review" => Ok(TimelineEventKind::FlaggedForReview),
            "claim_reclaimed" => Ok(TimelineEventKind::ClaimReclaimed),
            other => Err(format!("unknown timeline event kind: {other}")),
        }
    }
}

/// One entry in a report's append-only audit timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub kind: TimelineEventKind,
    pub at: DateTime<Utc>,
    /// `"system"` for engine-driven events, `"moderator:<id>"` / `"citizen:<id>"`
    /// for manual transitions.
    pub actor: String,
    pub details: serde_json::Value,
}

impl TimelineEvent {
    pub fn new(kind: TimelineEventKind, actor: &str, details: serde_json::Value) -> Self {
        Self {
            kind,
            at: Utc::now(),
            actor: actor.to_string(),
            details,
        }
    }

    pub fn submitted() -> Self {
        Self::new(TimelineEventKind::Submitted, "system", serde_json::json!({}))
    }

    pub fn status_changed(from: ReportStatus, to: ReportStatus, actor: &str, reason: &str) -> Self {
        Self::new(
            TimelineEventKind::StatusChanged,
            actor,
            serde_json::json!({
                "from": from.to_string(),
                "to": to.to_string(),
                "reason": reason,
            }),
        )
    }

    pub fn duplicate_linked(matched_report_id: Uuid, confidence: f64) -> Self {
        Self::new(
            TimelineEventKind::DuplicateLinked,
            "system",
            serde_json::json!({
                "duplicate_of": matched_report_id.to_string(),
                "confidence": confidence,
            }),
        )
    }

    pub fn classification_recorded(
        category: IssueCategory,
        severity: u8,
        confidence: f64,
    ) -> Self {
        Self::new(
            TimelineEventKind::ClassificationRecorded,
            "system",
            serde_json::json!({
                "category": category.to_string(),
                "severity": severity,
                "confidence": confidence,
            }),
        )
    }

    /// A flag carries a machine-readable reason code (`ai_unavailable`,
    /// `ai_rejected_request`, `verification_error`, `no_image`) so review
    /// queues can partition without a schema change.
    pub fn flagged(code: &str, message: &str) -> Self {
        Self::new(
            TimelineEventKind::FlaggedForReview,
            "system",
            serde_json::json!({ "code": code, "message": message }),
        )
    }

    pub fn claim_reclaimed(previous_worker: &str) -> Self {
        Self::new(
            TimelineEventKind::ClaimReclaimed,
            "system",
            serde_json::json!({ "previous_worker": previous_worker }),
        )
    }
}

// --- Report ---

/// One image attached to a report. The perceptual hash is `None` when the
/// image bytes could not be decoded; ingestion proceeds regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportImage {
    pub url: String,
    pub content_hash: String,
    pub perceptual_hash: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    /// `None` for anonymous submissions.
    pub reporter: Option<Uuid>,
    pub images: Vec<ReportImage>,
    pub location: GeoPoint,
    /// Precision-7 geohash cell derived from `location` at ingestion.
    pub geohash: String,
    pub category: IssueCategory,
    /// 1..=10, refined by classification once verified.
    pub severity: u8,
    pub status: ReportStatus,
    /// Write-once: set exactly once when the engine resolves the report as a
    /// duplicate, never overwritten afterwards.
    pub duplicate_of: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub timeline: Vec<TimelineEvent>,
}

impl Report {
    /// A freshly submitted report: pending verification, timeline seeded
    /// with the submission event.
    pub fn new(
        reporter: Option<Uuid>,
        images: Vec<ReportImage>,
        location: GeoPoint,
        geohash: String,
        category: IssueCategory,
        severity: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reporter,
            images,
            location,
            geohash,
            category,
            severity: severity.clamp(1, 10),
            status: ReportStatus::PendingVerification,
            duplicate_of: None,
            created_at: Utc::now(),
            timeline: vec![TimelineEvent::submitted()],
        }
    }
}

//! Postgres [`ReportStore`]. Claiming is a single conditional UPDATE; every
//! status change commits in one transaction with its timeline rows.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use civicwatch_common::{
    GeoPoint, IssueCategory, Report, ReportImage, ReportStatus, TimelineEvent, TimelineEventKind,
    VerifyError,
};
use civicwatch_verify::store::{Decision, ReportStore};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    reporter: Option<Uuid>,
    lat: f64,
    lng: f64,
    geohash: String,
    category: String,
    severity: i32,
    status: String,
    duplicate_of: Option<Uuid>,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ImageRow {
    report_id: Uuid,
    url: String,
    content_hash: String,
    perceptual_hash: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct TimelineRow {
    kind: String,
    at: DateTime<Utc>,
    actor: String,
    details: serde_json::Value,
}

impl ReportRow {
    fn into_report(
        self,
        images: Vec<ReportImage>,
        timeline: Vec<TimelineEvent>,
    ) -> Result<Report, VerifyError> {
        Ok(Report {
            id: self.id,
            reporter: self.reporter,
            images,
            location: GeoPoint { lat: self.lat, lng: self.lng },
            geohash: self.geohash,
            category: IssueCategory::parse_label(&self.category),
            severity: self.severity.clamp(1, 10) as u8,
            status: self.status.parse::<ReportStatus>().map_err(VerifyError::Storage)?,
            duplicate_of: self.duplicate_of,
            created_at: self.created_at,
            timeline,
        })
    }
}

impl ImageRow {
    fn into_image(self) -> ReportImage {
        ReportImage {
            url: self.url,
            content_hash: self.content_hash,
            // Stored bit-for-bit as a signed 64-bit column.
            perceptual_hash: self.perceptual_hash.map(|h| h as u64),
        }
    }
}

impl TimelineRow {
    fn into_event(self) -> Result<TimelineEvent, VerifyError> {
        Ok(TimelineEvent {
            kind: self.kind.parse::<TimelineEventKind>().map_err(VerifyError::Storage)?,
            at: self.at,
            actor: self.actor,
            details: self.details,
        })
    }
}

fn storage(err: sqlx::Error) -> VerifyError {
    VerifyError::Storage(err.to_string())
}

fn query_failure(err: sqlx::Error) -> VerifyError {
    VerifyError::DuplicateQuery(err.to_string())
}

/// Top 16 bits of the perceptual hash, the bucket the candidate index keys on.
fn bucket_of(hash: u64) -> i32 {
    (hash >> 48) as i32
}

// ---------------------------------------------------------------------------
// PgReportStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Attach images to a batch of candidate rows in one query. Candidate
    /// reports omit timelines; the detector only reads hashes and metadata.
    async fn assemble_candidates(
        &self,
        rows: Vec<ReportRow>,
    ) -> Result<Vec<Report>, VerifyError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let image_rows = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT report_id, url, content_hash, perceptual_hash
            FROM report_images
            WHERE report_id = ANY($1)
            ORDER BY report_id, position
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failure)?;

        let mut by_report: HashMap<Uuid, Vec<ReportImage>> = HashMap::new();
        for row in image_rows {
            by_report.entry(row.report_id).or_default().push(row.into_image());
        }

        rows.into_iter()
            .map(|row| {
                let images = by_report.remove(&row.id).unwrap_or_default();
                row.into_report(images, Vec::new())
            })
            .collect()
    }

    /// Ids of pending reports with no live claim, oldest first. The worker
    /// process polls this as its job intake; the claim CAS makes a report
    /// queued twice harmless.
    pub async fn pending_unclaimed(&self, limit: i64) -> Result<Vec<Uuid>, VerifyError> {
        let rows = sqlx::query_as::<_, (Uuid,)>(
            r#"
            SELECT id
            FROM reports
            WHERE status = 'pending_verification'
              AND (claimed_by IS NULL OR claim_expires_at <= NOW())
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn exists(&self, id: Uuid) -> Result<bool, VerifyError> {
        let row = sqlx::query_as::<_, (bool,)>("SELECT EXISTS(SELECT 1 FROM reports WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.0)
    }
}

async fn append_events(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    report_id: Uuid,
    events: &[TimelineEvent],
) -> Result<(), VerifyError> {
    for event in events {
        sqlx::query(
            r#"
            INSERT INTO report_timeline (report_id, kind, at, actor, details)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(report_id)
        .bind(event.kind.to_string())
        .bind(event.at)
        .bind(&event.actor)
        .bind(&event.details)
        .execute(&mut **tx)
        .await
        .map_err(storage)?;
    }
    Ok(())
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn fetch(&self, id: Uuid) -> Result<Report, VerifyError> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, reporter, lat, lng, geohash, category, severity, status,
                   duplicate_of, created_at
            FROM reports
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        .ok_or(VerifyError::NotFound(id))?;

        let images = sqlx::query_as::<_, ImageRow>(
            r#"
            SELECT report_id, url, content_hash, perceptual_hash
            FROM report_images
            WHERE report_id = $1
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?
        .into_iter()
        .map(ImageRow::into_image)
        .collect();

        let timeline = sqlx::query_as::<_, TimelineRow>(
            r#"
            SELECT kind, at, actor, details
            FROM report_timeline
            WHERE report_id = $1
            ORDER BY seq
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?
        .into_iter()
        .map(TimelineRow::into_event)
        .collect::<Result<Vec<_>, _>>()?;

        row.into_report(images, timeline)
    }

    async fn insert(&self, report: Report) -> Result<(), VerifyError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        sqlx::query(
            r#"
            INSERT INTO reports (id, reporter, lat, lng, geohash, category, severity,
                                 status, duplicate_of, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(report.id)
        .bind(report.reporter)
        .bind(report.location.lat)
        .bind(report.location.lng)
        .bind(&report.geohash)
        .bind(report.category.to_string())
        .bind(report.severity as i32)
        .bind(report.status.to_string())
        .bind(report.duplicate_of)
        .bind(report.created_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        for (position, image) in report.images.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO report_images (report_id, position, url, content_hash,
                                           perceptual_hash, bucket)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(report.id)
            .bind(position as i32)
            .bind(&image.url)
            .bind(&image.content_hash)
            .bind(image.perceptual_hash.map(|h| h as i64))
            .bind(image.perceptual_hash.map(bucket_of))
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        append_events(&mut tx, report.id, &report.timeline).await?;
        tx.commit().await.map_err(storage)
    }

    async fn claim_for_verification(
        &self,
        id: Uuid,
        worker: &str,
        lease: Duration,
    ) -> Result<(), VerifyError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(lease).map_err(|e| VerifyError::Storage(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE reports
            SET claimed_by = $2, claim_expires_at = $3
            WHERE id = $1
              AND status = 'pending_verification'
              AND (claimed_by IS NULL OR claim_expires_at <= NOW())
            "#,
        )
        .bind(id)
        .bind(worker)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            if !self.exists(id).await? {
                return Err(VerifyError::NotFound(id));
            }
            return Err(VerifyError::ConcurrentClaim);
        }
        debug!(report_id = %id, worker, "claimed report for verification");
        Ok(())
    }

    async fn commit_decision(
        &self,
        id: Uuid,
        worker: &str,
        decision: Decision,
    ) -> Result<(), VerifyError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // Lock and re-check the duplicate target inside the transaction.
        // Symmetric commits serialize on the row locks (Postgres aborts one
        // side of a cross-lock, and that job is re-run), so two reports can
        // never commit as duplicates of each other.
        if let Some(target) = decision.duplicate_of {
            let row = sqlx::query_as::<_, (String,)>(
                "SELECT status FROM reports WHERE id = $1 FOR UPDATE",
            )
            .bind(target)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?;
            let target_active = row
                .and_then(|(status,)| status.parse::<ReportStatus>().ok())
                .is_some_and(|status| status.is_active());
            if !target_active {
                return Err(VerifyError::StaleDuplicateTarget(target));
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE reports
            SET status = $2,
                duplicate_of = COALESCE(duplicate_of, $3),
                category = COALESCE($4, category),
                severity = COALESCE($5, severity),
                claimed_by = NULL,
                claim_expires_at = NULL
            WHERE id = $1
              AND status = 'pending_verification'
              AND claimed_by = $6
              AND ($3::uuid IS NULL OR duplicate_of IS NULL)
            "#,
        )
        .bind(id)
        .bind(decision.status.to_string())
        .bind(decision.duplicate_of)
        .bind(decision.category.map(|c| c.to_string()))
        .bind(decision.severity.map(|s| i32::from(s.clamp(1, 10))))
        .bind(worker)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            let row = sqlx::query_as::<_, (String, Option<String>)>(
                "SELECT status, claimed_by FROM reports WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
            return match row {
                None => Err(VerifyError::NotFound(id)),
                Some((status, _)) if status != "pending_verification" => {
                    Err(VerifyError::Storage(format!("report {id} already decided ({status})")))
                }
                Some((_, claimed_by)) if claimed_by.as_deref() != Some(worker) => {
                    Err(VerifyError::ConcurrentClaim)
                }
                Some(_) => Err(VerifyError::Storage(format!(
                    "duplicate_of is write-once for report {id}"
                ))),
            };
        }

        append_events(&mut tx, id, &decision.events).await?;
        tx.commit().await.map_err(storage)
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        expected: ReportStatus,
        to: ReportStatus,
        event: TimelineEvent,
    ) -> Result<(), VerifyError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let result = sqlx::query(
            "UPDATE reports SET status = $3 WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(expected.to_string())
        .bind(to.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            if !self.exists(id).await? {
                return Err(VerifyError::NotFound(id));
            }
            return Err(VerifyError::Storage(format!(
                "report {id} is no longer {expected}"
            )));
        }

        append_events(&mut tx, id, std::slice::from_ref(&event)).await?;
        tx.commit().await.map_err(storage)
    }

    async fn candidates_by_bucket(
        &self,
        bucket: u16,
        since: DateTime<Utc>,
    ) -> Result<Vec<Report>, VerifyError> {
        let rows = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT DISTINCT r.id, r.reporter, r.lat, r.lng, r.geohash, r.category,
                   r.severity, r.status, r.duplicate_of, r.created_at
            FROM reports r
            JOIN report_images i ON i.report_id = r.id
            WHERE i.bucket = $1 AND r.created_at >= $2
            ORDER BY r.created_at DESC
            "#,
        )
        .bind(i32::from(bucket))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failure)?;

        self.assemble_candidates(rows).await
    }

    async fn candidates_by_cells(
        &self,
        cells: &[String],
        category: IssueCategory,
        since: DateTime<Utc>,
    ) -> Result<Vec<Report>, VerifyError> {
        let rows = sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, reporter, lat, lng, geohash, category, severity, status,
                   duplicate_of, created_at
            FROM reports
            WHERE geohash = ANY($1) AND category = $2 AND created_at >= $3
            ORDER BY created_at DESC
            "#,
        )
        .bind(cells)
        .bind(category.to_string())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failure)?;

        self.assemble_candidates(rows).await
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, VerifyError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;

        // SKIP LOCKED keeps concurrent sweepers from double-reclaiming.
        let expired = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            SELECT id, claimed_by
            FROM reports
            WHERE status = 'pending_verification'
              AND claimed_by IS NOT NULL
              AND claim_expires_at <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (id, previous_worker) in expired {
            sqlx::query(
                "UPDATE reports SET claimed_by = NULL, claim_expires_at = NULL WHERE id = $1",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

            let event = TimelineEvent::claim_reclaimed(&previous_worker);
            append_events(&mut tx, id, std::slice::from_ref(&event)).await?;
            reclaimed.push(id);
        }

        tx.commit().await.map_err(storage)?;
        Ok(reclaimed)
    }
}

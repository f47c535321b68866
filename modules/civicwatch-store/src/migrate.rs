//! Idempotent schema setup. Applied on worker startup; safe to re-run.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS reports (
        id UUID PRIMARY KEY,
        reporter UUID,
        lat DOUBLE PRECISION NOT NULL,
        lng DOUBLE PRECISION NOT NULL,
        geohash TEXT NOT NULL,
        category TEXT NOT NULL,
        severity INT NOT NULL,
        status TEXT NOT NULL,
        duplicate_of UUID,
        created_at TIMESTAMPTZ NOT NULL,
        claimed_by TEXT,
        claim_expires_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS report_images (
        report_id UUID NOT NULL REFERENCES reports(id),
        position INT NOT NULL,
        url TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        perceptual_hash BIGINT,
        bucket INT,
        PRIMARY KEY (report_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS report_timeline (
        seq BIGSERIAL PRIMARY KEY,
        report_id UUID NOT NULL REFERENCES reports(id),
        kind TEXT NOT NULL,
        at TIMESTAMPTZ NOT NULL,
        actor TEXT NOT NULL,
        details JSONB NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_reports_geohash ON reports (geohash, category, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_reports_claims ON reports (status, claim_expires_at)",
    "CREATE INDEX IF NOT EXISTS idx_images_bucket ON report_images (bucket)",
    "CREATE INDEX IF NOT EXISTS idx_timeline_report ON report_timeline (report_id, seq)",
];

pub async fn migrate(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("report store schema up to date");
    Ok(())
}

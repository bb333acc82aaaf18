//! Route version database queries

use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::store::ActivationOutcome;
use crate::types::{
    GenerationSource, Leg, NewRouteVersion, OptimizationConstraints, RouteMetrics, RouteVersion,
    RouteWarning, Stop, VersionStatus,
};

const VERSION_COLUMNS: &str = r#"
    id, load_id, version_number, status, source, derived_from_version_id, reason,
    stops, return_leg, total_distance_km, total_duration_minutes, total_days,
    estimated_completion, constraints, departure, warnings, load_fingerprint,
    road_coefficient, created_at, created_by, activated_at
"#;

/// Row as stored in `route_versions`
#[derive(Debug, sqlx::FromRow)]
pub struct RouteVersionRow {
    pub id: Uuid,
    pub load_id: Uuid,
    pub version_number: i32,
    pub status: VersionStatus,
    pub source: GenerationSource,
    pub derived_from_version_id: Option<Uuid>,
    pub reason: Option<String>,
    pub stops: Json<Vec<Stop>>,
    pub return_leg: Option<Json<Leg>>,
    pub total_distance_km: f64,
    pub total_duration_minutes: f64,
    pub total_days: i32,
    pub estimated_completion: Option<NaiveDateTime>,
    pub constraints: Json<OptimizationConstraints>,
    pub departure: NaiveDateTime,
    pub warnings: Json<Vec<RouteWarning>>,
    pub load_fingerprint: String,
    pub road_coefficient: f64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub activated_at: Option<DateTime<Utc>>,
}

impl From<RouteVersionRow> for RouteVersion {
    fn from(row: RouteVersionRow) -> Self {
        RouteVersion {
            id: row.id,
            load_id: row.load_id,
            version_number: row.version_number,
            status: row.status,
            stops: row.stops.0,
            metrics: RouteMetrics {
                total_distance_km: row.total_distance_km,
                total_duration_minutes: row.total_duration_minutes,
                total_days: u32::try_from(row.total_days).unwrap_or(0),
                estimated_completion: row.estimated_completion,
            },
            return_leg: row.return_leg.map(|leg| leg.0),
            source: row.source,
            derived_from_version_id: row.derived_from_version_id,
            reason: row.reason,
            constraints: row.constraints.0,
            departure: row.departure,
            warnings: row.warnings.0,
            load_fingerprint: row.load_fingerprint,
            road_coefficient: row.road_coefficient,
            created_at: row.created_at,
            created_by: row.created_by,
            activated_at: row.activated_at,
        }
    }
}

/// Insert a DRAFT, taking the next number from the per-load counter.
pub async fn insert_version(pool: &PgPool, version: NewRouteVersion) -> Result<RouteVersion> {
    let mut tx = pool.begin().await?;

    let version_number: i32 = sqlx::query_scalar(
        r#"
        INSERT INTO load_route_state (load_id, last_version_number)
        VALUES ($1, 1)
        ON CONFLICT (load_id) DO UPDATE
            SET last_version_number = load_route_state.last_version_number + 1
        RETURNING last_version_number
        "#,
    )
    .bind(version.load_id)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO route_versions (
            id, load_id, version_number, status, source, derived_from_version_id, reason,
            stops, return_leg, total_distance_km, total_duration_minutes, total_days,
            estimated_completion, constraints, departure, warnings, load_fingerprint,
            road_coefficient, created_at, created_by
        )
        VALUES ($1, $2, $3, 'draft', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(version.id)
    .bind(version.load_id)
    .bind(version_number)
    .bind(version.source)
    .bind(version.derived_from_version_id)
    .bind(&version.reason)
    .bind(Json(&version.stops))
    .bind(version.return_leg.map(Json))
    .bind(version.metrics.total_distance_km)
    .bind(version.metrics.total_duration_minutes)
    .bind(version.metrics.total_days as i32)
    .bind(version.metrics.estimated_completion)
    .bind(Json(&version.constraints))
    .bind(version.departure)
    .bind(Json(&version.warnings))
    .bind(&version.load_fingerprint)
    .bind(version.road_coefficient)
    .bind(version.created_at)
    .bind(&version.created_by)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(version.into_draft(version_number))
}

pub async fn get_version(pool: &PgPool, version_id: Uuid) -> Result<Option<RouteVersion>> {
    let row = sqlx::query_as::<_, RouteVersionRow>(&format!(
        "SELECT {} FROM route_versions WHERE id = $1",
        VERSION_COLUMNS
    ))
    .bind(version_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(RouteVersion::from))
}

pub async fn list_versions(pool: &PgPool, load_id: Uuid) -> Result<Vec<RouteVersion>> {
    let rows = sqlx::query_as::<_, RouteVersionRow>(&format!(
        "SELECT {} FROM route_versions WHERE load_id = $1 ORDER BY version_number",
        VERSION_COLUMNS
    ))
    .bind(load_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(RouteVersion::from).collect())
}

pub async fn active_version_id(pool: &PgPool, load_id: Uuid) -> Result<Option<Uuid>> {
    let active: Option<Option<Uuid>> = sqlx::query_scalar(
        "SELECT active_version_id FROM load_route_state WHERE load_id = $1"
    )
    .bind(load_id)
    .fetch_optional(pool)
    .await?;

    Ok(active.flatten())
}

/// Compare-and-swap the load's active pointer and swap statuses in one transaction.
pub async fn activate(
    pool: &PgPool,
    load_id: Uuid,
    version_id: Uuid,
    expected: Option<Uuid>,
    activated_at: DateTime<Utc>,
) -> Result<ActivationOutcome> {
    let mut tx = pool.begin().await?;

    let status: Option<VersionStatus> = sqlx::query_scalar(
        "SELECT status FROM route_versions WHERE id = $1 AND load_id = $2 FOR UPDATE"
    )
    .bind(version_id)
    .bind(load_id)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(status) = status else {
        anyhow::bail!("route version {} does not belong to load {}", version_id, load_id);
    };
    if !status.can_activate() {
        tx.rollback().await?;
        return Ok(ActivationOutcome::StatusChanged { status });
    }

    let swapped = sqlx::query(
        r#"
        UPDATE load_route_state
        SET active_version_id = $2
        WHERE load_id = $1 AND active_version_id IS NOT DISTINCT FROM $3
        "#,
    )
    .bind(load_id)
    .bind(version_id)
    .bind(expected)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if swapped == 0 {
        tx.rollback().await?;
        let current = active_version_id(pool, load_id).await?;
        return Ok(ActivationOutcome::PointerMoved { current });
    }

    if let Some(previous) = expected {
        sqlx::query("UPDATE route_versions SET status = 'superseded' WHERE id = $1 AND status = 'active'")
            .bind(previous)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query("UPDATE route_versions SET status = 'active', activated_at = $2 WHERE id = $1")
        .bind(version_id)
        .bind(activated_at)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(ActivationOutcome::Activated { superseded: expected })
}

/// Move a version from one status to another; false when it was not in `from`.
pub async fn transition(
    pool: &PgPool,
    version_id: Uuid,
    from: VersionStatus,
    to: VersionStatus,
) -> Result<bool> {
    let result = sqlx::query("UPDATE route_versions SET status = $3 WHERE id = $1 AND status = $2")
        .bind(version_id)
        .bind(from)
        .bind(to)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() == 1)
}

//! Route feedback queries

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::store::DeviationMetric;
use crate::types::RouteFeedback;

#[derive(Debug, sqlx::FromRow)]
struct FeedbackRow {
    id: Uuid,
    version_id: Uuid,
    rating: i16,
    comments: String,
    actual_duration_minutes: Option<f64>,
    actual_distance_km: Option<f64>,
    issues: Vec<String>,
    duration_deviation: Option<f64>,
    distance_deviation: Option<f64>,
    road_coefficient: Option<f64>,
    recorded_at: DateTime<Utc>,
}

impl From<FeedbackRow> for RouteFeedback {
    fn from(row: FeedbackRow) -> Self {
        RouteFeedback {
            id: row.id,
            version_id: row.version_id,
            rating: u8::try_from(row.rating).unwrap_or(0),
            comments: row.comments,
            actual_duration_minutes: row.actual_duration_minutes,
            actual_distance_km: row.actual_distance_km,
            issues: row.issues,
            duration_deviation: row.duration_deviation,
            distance_deviation: row.distance_deviation,
            road_coefficient: row.road_coefficient,
            recorded_at: row.recorded_at,
        }
    }
}

pub async fn insert_feedback(pool: &PgPool, feedback: &RouteFeedback) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO route_feedback (
            id, version_id, rating, comments, actual_duration_minutes, actual_distance_km,
            issues, duration_deviation, distance_deviation, road_coefficient, recorded_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(feedback.id)
    .bind(feedback.version_id)
    .bind(i16::from(feedback.rating))
    .bind(&feedback.comments)
    .bind(feedback.actual_duration_minutes)
    .bind(feedback.actual_distance_km)
    .bind(&feedback.issues)
    .bind(feedback.duration_deviation)
    .bind(feedback.distance_deviation)
    .bind(feedback.road_coefficient)
    .bind(feedback.recorded_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_feedback(pool: &PgPool, version_id: Uuid) -> Result<Vec<RouteFeedback>> {
    let rows = sqlx::query_as::<_, FeedbackRow>(
        r#"
        SELECT id, version_id, rating, comments, actual_duration_minutes, actual_distance_km,
               issues, duration_deviation, distance_deviation, road_coefficient, recorded_at
        FROM route_feedback
        WHERE version_id = $1
        ORDER BY recorded_at
        "#,
    )
    .bind(version_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(RouteFeedback::from).collect())
}

/// Newest non-null deviations of one metric
pub async fn recent_deviations(pool: &PgPool, metric: DeviationMetric, limit: usize) -> Result<Vec<f64>> {
    let column = match metric {
        DeviationMetric::Duration => "duration_deviation",
        DeviationMetric::Distance => "distance_deviation",
    };

    let values: Vec<f64> = sqlx::query_scalar(&format!(
        "SELECT {column} FROM route_feedback WHERE {column} IS NOT NULL ORDER BY recorded_at DESC LIMIT $1"
    ))
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    Ok(values)
}

/// Newest (road coefficient, distance deviation) pairs from fully approximated versions
pub async fn recent_coefficient_samples(pool: &PgPool, limit: usize) -> Result<Vec<(f64, f64)>> {
    let samples: Vec<(f64, f64)> = sqlx::query_as(
        r#"
        SELECT road_coefficient, distance_deviation
        FROM route_feedback
        WHERE road_coefficient IS NOT NULL AND distance_deviation IS NOT NULL
        ORDER BY recorded_at DESC
        LIMIT $1
        "#,
    )
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    Ok(samples)
}

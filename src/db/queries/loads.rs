//! Load registry queries

use anyhow::Result;
use chrono::NaiveDate;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{Coordinates, Destination, Load};

#[derive(Debug, sqlx::FromRow)]
struct LoadRow {
    id: Uuid,
    origin_lat: f64,
    origin_lng: f64,
}

#[derive(Debug, sqlx::FromRow)]
struct DestinationRow {
    id: Uuid,
    lat: f64,
    lng: f64,
    address: String,
    expected_delivery_date: Option<NaiveDate>,
}

impl From<DestinationRow> for Destination {
    fn from(row: DestinationRow) -> Self {
        Destination {
            id: row.id,
            coordinates: Coordinates::new(row.lat, row.lng),
            address: row.address,
            expected_delivery_date: row.expected_delivery_date,
        }
    }
}

/// Get a load with its destinations in registry order
pub async fn get_load(pool: &PgPool, load_id: Uuid) -> Result<Option<Load>> {
    let row = sqlx::query_as::<_, LoadRow>(
        "SELECT id, origin_lat, origin_lng FROM loads WHERE id = $1"
    )
    .bind(load_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let destinations = sqlx::query_as::<_, DestinationRow>(
        r#"
        SELECT id, lat, lng, address, expected_delivery_date
        FROM load_destinations
        WHERE load_id = $1
        ORDER BY position
        "#,
    )
    .bind(load_id)
    .fetch_all(pool)
    .await?;

    Ok(Some(Load {
        id: row.id,
        origin: Coordinates::new(row.origin_lat, row.origin_lng),
        destinations: destinations.into_iter().map(Destination::from).collect(),
        active_version_id: None,
    }))
}

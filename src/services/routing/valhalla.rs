//! Valhalla routing engine client
//!
//! Valhalla API documentation:
//! https://valhalla.github.io/valhalla/api/matrix/api-reference/

use async_trait::async_trait;
use anyhow::{Result, Context};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::Coordinates;
use super::{ProviderLeg, RoutingProvider};

/// Valhalla client configuration
#[derive(Debug, Clone)]
pub struct ValhallaConfig {
    /// Base URL of Valhalla server (e.g., "http://localhost:8002")
    pub base_url: String,
    /// Transport-level request timeout in seconds; the estimator applies its own tighter bound
    pub timeout_seconds: u64,
}

impl Default for ValhallaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8002".to_string(),
            timeout_seconds: 30,
        }
    }
}

impl ValhallaConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// Valhalla routing client
pub struct ValhallaClient {
    client: Client,
    config: ValhallaConfig,
}

impl ValhallaClient {
    pub fn new(config: ValhallaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, config })
    }

    /// Build a one-to-one sources_to_targets request
    fn build_leg_request(&self, from: &Coordinates, to: &Coordinates, use_traffic: bool) -> MatrixRequest {
        let location = |c: &Coordinates| ValhallaLocation {
            lat: c.lat,
            lon: c.lng,
            // 500m radius for depot/dock coordinates that sit off the road edge
            radius: Some(500),
        };

        MatrixRequest {
            sources: vec![location(from)],
            targets: vec![location(to)],
            costing: "truck".to_string(),
            units: "kilometers".to_string(),
            // type 0 = depart now, which enables live/predicted traffic speeds
            date_time: use_traffic.then_some(DateTimeOption { r#type: 0 }),
        }
    }
}

#[async_trait]
impl RoutingProvider for ValhallaClient {
    async fn route_leg(&self, from: &Coordinates, to: &Coordinates, use_traffic: bool) -> Result<ProviderLeg> {
        let request = self.build_leg_request(from, to, use_traffic);
        let url = format!("{}/sources_to_targets", self.config.base_url);

        debug!(
            "Requesting leg from Valhalla: ({}, {}) -> ({}, {}), traffic={}",
            from.lat, from.lng, to.lat, to.lng, use_traffic
        );

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Valhalla")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Valhalla returned error {}: {}", status, body);
        }

        let matrix_response: MatrixResponse = response
            .json()
            .await
            .context("Failed to parse Valhalla response")?;

        leg_from_response(&matrix_response)
    }

    fn name(&self) -> &str {
        "Valhalla"
    }
}

fn leg_from_response(response: &MatrixResponse) -> Result<ProviderLeg> {
    let cell = response
        .sources_to_targets
        .first()
        .and_then(|row| row.first())
        .context("Valhalla returned an empty matrix")?;

    match (cell.distance, cell.time) {
        (Some(distance_km), Some(time_s)) => Ok(ProviderLeg {
            distance_km,
            duration_minutes: time_s / 60.0,
        }),
        _ => anyhow::bail!("Valhalla found no route between the points"),
    }
}

// Valhalla API types

#[derive(Debug, Serialize)]
struct MatrixRequest {
    sources: Vec<ValhallaLocation>,
    targets: Vec<ValhallaLocation>,
    costing: String,
    units: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    date_time: Option<DateTimeOption>,
}

#[derive(Debug, Serialize)]
struct DateTimeOption {
    r#type: u8,
}

#[derive(Debug, Serialize, Clone)]
struct ValhallaLocation {
    lat: f64,
    lon: f64,
    /// Radius in meters for snapping to roads
    #[serde(skip_serializing_if = "Option::is_none")]
    radius: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MatrixResponse {
    sources_to_targets: Vec<Vec<MatrixCell>>,
}

#[derive(Debug, Deserialize)]
struct MatrixCell {
    /// Distance in kilometers (when units="kilometers")
    distance: Option<f64>,
    /// Time in seconds
    time: Option<f64>,
}

//! Road conditions (traffic and weather) used as risk penalties by the sequencer

#[cfg(test)]
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::defaults::TRAFFIC_SAMPLE_OFFSET_DEG;
use crate::services::routing::RoutingProvider;
use crate::types::Coordinates;

/// Traffic level and weather severity at a point, each in [0, 1].
///
/// `None` means unknown and carries no penalty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoadConditions {
    pub traffic_level: Option<f64>,
    pub weather_severity: Option<f64>,
}

impl RoadConditions {
    pub const UNKNOWN: RoadConditions = RoadConditions {
        traffic_level: None,
        weather_severity: None,
    };

    pub fn new(traffic_level: f64, weather_severity: f64) -> Self {
        Self {
            traffic_level: Some(clamp_unit(traffic_level)),
            weather_severity: Some(clamp_unit(weather_severity)),
        }
    }

    pub fn traffic(&self) -> f64 {
        self.traffic_level.map(clamp_unit).unwrap_or(0.0)
    }

    pub fn weather(&self) -> f64 {
        self.weather_severity.map(clamp_unit).unwrap_or(0.0)
    }

    /// Conditions along a leg: the worse of its two endpoints.
    pub fn worst(a: &RoadConditions, b: &RoadConditions) -> RoadConditions {
        RoadConditions {
            traffic_level: max_known(a.traffic_level, b.traffic_level),
            weather_severity: max_known(a.weather_severity, b.weather_severity),
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn max_known(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Source of traffic/weather information
#[async_trait]
pub trait ConditionsProvider: Send + Sync {
    async fn conditions_at(&self, point: &Coordinates) -> Result<RoadConditions>;

    fn name(&self) -> &str;
}

/// Fixed conditions per point, unknown elsewhere
#[cfg(test)]
#[derive(Default)]
pub struct StaticConditionsProvider {
    by_point: HashMap<(u64, u64), RoadConditions>,
}

#[cfg(test)]
impl StaticConditionsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_point(mut self, point: Coordinates, conditions: RoadConditions) -> Self {
        self.by_point.insert(point.key(), conditions);
        self
    }
}

#[cfg(test)]
#[async_trait]
impl ConditionsProvider for StaticConditionsProvider {
    async fn conditions_at(&self, point: &Coordinates) -> Result<RoadConditions> {
        Ok(self.by_point.get(&point.key()).copied().unwrap_or(RoadConditions::UNKNOWN))
    }

    fn name(&self) -> &str {
        "StaticConditions"
    }
}

/// Traffic level from a live/free-flow ratio: 1.0 is free flow, twice the
/// free-flow time or worse is full congestion.
pub fn traffic_level(congestion_ratio: f64) -> f64 {
    clamp_unit(congestion_ratio - 1.0)
}

/// Traffic derived from a routing provider's time-dependent costing.
///
/// A short sample leg starting at the point is routed twice, departing now
/// and at free-flow speeds. Weather stays unknown.
pub struct RoutingTrafficProvider {
    routing: Arc<dyn RoutingProvider>,
}

impl RoutingTrafficProvider {
    pub fn new(routing: Arc<dyn RoutingProvider>) -> Self {
        Self { routing }
    }

    fn sample_target(point: &Coordinates) -> Coordinates {
        if point.lat + TRAFFIC_SAMPLE_OFFSET_DEG <= 90.0 {
            Coordinates::new(point.lat + TRAFFIC_SAMPLE_OFFSET_DEG, point.lng)
        } else {
            Coordinates::new(point.lat - TRAFFIC_SAMPLE_OFFSET_DEG, point.lng)
        }
    }
}

#[async_trait]
impl ConditionsProvider for RoutingTrafficProvider {
    async fn conditions_at(&self, point: &Coordinates) -> Result<RoadConditions> {
        let target = Self::sample_target(point);
        let (live, free_flow) = futures::try_join!(
            self.routing.route_leg(point, &target, true),
            self.routing.route_leg(point, &target, false),
        )?;

        if !(free_flow.duration_minutes.is_finite() && free_flow.duration_minutes > 0.0) {
            anyhow::bail!("{} returned no free-flow time near ({}, {})", self.routing.name(), point.lat, point.lng);
        }
        let ratio = live.duration_minutes / free_flow.duration_minutes;
        debug!("Congestion ratio {:.2} at ({}, {})", ratio, point.lat, point.lng);

        Ok(RoadConditions {
            traffic_level: Some(traffic_level(ratio)),
            weather_severity: None,
        })
    }

    fn name(&self) -> &str {
        "RoutingTraffic"
    }
}

/// Merges several sources, keeping the worse known level of each kind.
///
/// Fails only when every source fails.
pub struct LayeredConditionsProvider {
    sources: Vec<Arc<dyn ConditionsProvider>>,
}

impl LayeredConditionsProvider {
    pub fn new(sources: Vec<Arc<dyn ConditionsProvider>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl ConditionsProvider for LayeredConditionsProvider {
    async fn conditions_at(&self, point: &Coordinates) -> Result<RoadConditions> {
        let answers = join_all(self.sources.iter().map(|source| source.conditions_at(point))).await;

        let mut merged: Option<RoadConditions> = None;
        let mut last_error = None;
        for (source, answer) in self.sources.iter().zip(answers) {
            match answer {
                Ok(conditions) => {
                    merged = Some(match merged {
                        Some(current) => RoadConditions::worst(&current, &conditions),
                        None => conditions,
                    });
                }
                Err(e) => {
                    debug!("{} failed for ({}, {}): {}", source.name(), point.lat, point.lng, e);
                    last_error = Some(e);
                }
            }
        }

        match (merged, last_error) {
            (Some(conditions), _) => Ok(conditions),
            (None, Some(e)) => Err(e),
            (None, None) => Ok(RoadConditions::UNKNOWN),
        }
    }

    fn name(&self) -> &str {
        "LayeredConditions"
    }
}

/// Open-Meteo current weather client.
///
/// Only weather is reported; traffic comes from [`RoutingTrafficProvider`].
pub struct OpenMeteoClient {
    client: Client,
    base_url: String,
}

impl OpenMeteoClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentWeather,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    weather_code: Option<u16>,
    wind_speed_10m: Option<f64>,
}

#[async_trait]
impl ConditionsProvider for OpenMeteoClient {
    async fn conditions_at(&self, point: &Coordinates) -> Result<RoadConditions> {
        let url = format!("{}/v1/forecast", self.base_url.trim_end_matches('/'));
        debug!("Requesting weather for ({}, {})", point.lat, point.lng);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("latitude", point.lat.to_string()),
                ("longitude", point.lng.to_string()),
                ("current", "weather_code,wind_speed_10m".to_string()),
            ])
            .send()
            .await
            .context("Failed to send request to weather service")?;

        if !response.status().is_success() {
            anyhow::bail!("Weather service returned status {}", response.status());
        }

        let forecast: ForecastResponse = response
            .json()
            .await
            .context("Failed to parse weather response")?;

        Ok(RoadConditions {
            traffic_level: None,
            weather_severity: Some(weather_severity(
                forecast.current.weather_code,
                forecast.current.wind_speed_10m,
            )),
        })
    }

    fn name(&self) -> &str {
        "OpenMeteo"
    }
}

/// Map a WMO weather code and wind speed (km/h) to a severity in [0, 1]
pub fn weather_severity(weather_code: Option<u16>, wind_speed_kmh: Option<f64>) -> f64 {
    let from_code = match weather_code {
        Some(0..=3) | None => 0.0,
        Some(45 | 48) => 0.4,
        Some(51..=57) => 0.2,
        Some(61 | 63 | 80) => 0.4,
        Some(65 | 81) => 0.6,
        Some(66 | 67 | 82) => 0.7,
        Some(71 | 73 | 77) => 0.6,
        Some(75 | 85 | 86) => 0.8,
        Some(95..=99) => 1.0,
        Some(_) => 0.2,
    };

    let from_wind = match wind_speed_kmh {
        Some(w) if w >= 90.0 => 1.0,
        Some(w) if w >= 70.0 => 0.7,
        Some(w) if w >= 50.0 => 0.4,
        _ => 0.0,
    };

    f64::max(from_code, from_wind)
}

/// Create the conditions provider from configuration.
///
/// Weather comes from Open-Meteo when a URL is set, traffic from the routing
/// provider when one is configured.
pub fn create_conditions_provider(
    weather_url: Option<String>,
    routing: Option<Arc<dyn RoutingProvider>>,
) -> Result<Option<Arc<dyn ConditionsProvider>>> {
    let mut sources: Vec<Arc<dyn ConditionsProvider>> = Vec::new();

    match weather_url {
        Some(url) => {
            info!("Weather conditions from {}", url);
            sources.push(Arc::new(OpenMeteoClient::new(url)?));
        }
        None => info!("No weather service configured, weather is unknown"),
    }
    match routing {
        Some(routing) => {
            info!("Traffic levels from {} time-dependent routing", routing.name());
            sources.push(Arc::new(RoutingTrafficProvider::new(routing)));
        }
        None => info!("No routing provider configured, traffic is unknown"),
    }

    Ok(match sources.len() {
        0 => None,
        1 => sources.pop(),
        _ => Some(Arc::new(LayeredConditionsProvider::new(sources))),
    })
}

/// Look up conditions for every point, in order.
///
/// Failures and timeouts degrade to [`RoadConditions::UNKNOWN`].
pub async fn conditions_for_points(
    provider: Option<&dyn ConditionsProvider>,
    points: &[Coordinates],
    max_in_flight: usize,
    per_call_timeout: Duration,
) -> Vec<RoadConditions> {
    let Some(provider) = provider else {
        return vec![RoadConditions::UNKNOWN; points.len()];
    };

    let lookups: Vec<_> = points
        .iter()
        .map(|point| async move {
            match tokio::time::timeout(per_call_timeout, provider.conditions_at(point)).await {
                Ok(Ok(conditions)) => conditions,
                Ok(Err(e)) => {
                    warn!("{} failed for ({}, {}): {}", provider.name(), point.lat, point.lng, e);
                    RoadConditions::UNKNOWN
                }
                Err(_) => {
                    warn!("{} timed out for ({}, {})", provider.name(), point.lat, point.lng);
                    RoadConditions::UNKNOWN
                }
            }
        })
        .collect();

    stream::iter(lookups)
        .buffered(max_in_flight.max(1))
        .collect()
        .await
}

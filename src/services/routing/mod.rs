//! Routing provider abstraction for single-leg distance/time lookups
//!
//! Uses Valhalla in production and a deterministic mock in tests.

mod valhalla;

pub use valhalla::{ValhallaClient, ValhallaConfig};

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
#[cfg(test)]
use std::time::Duration;

use async_trait::async_trait;
use anyhow::Result;
use tracing::{info, warn};

#[cfg(test)]
use crate::services::geo::{road_distance, travel_time_minutes};
use crate::types::Coordinates;

/// Distance and duration reported by a provider for one leg
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderLeg {
    pub distance_km: f64,
    pub duration_minutes: f64,
}

/// Routing provider trait for abstraction (Valhalla, mock, etc.)
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    /// Look up distance and travel time between two points
    async fn route_leg(&self, from: &Coordinates, to: &Coordinates, use_traffic: bool) -> Result<ProviderLeg>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

#[cfg(test)]
/// Mock routing provider for tests
///
/// Uses Haversine distance × coefficient. Can be told to fail the first N
/// calls, or every call, and to delay responses.
pub struct MockRoutingProvider {
    /// Coefficient for converting straight-line to road distance
    road_coefficient: f64,
    /// Average speed in km/h for time estimation
    average_speed_kmh: f64,
    failures_remaining: AtomicUsize,
    always_fail: bool,
    delay: Option<Duration>,
    /// Live durations are this many times the free-flow ones
    traffic_factor: f64,
    calls: AtomicUsize,
}

#[cfg(test)]
impl Default for MockRoutingProvider {
    fn default() -> Self {
        Self {
            road_coefficient: 1.2,
            average_speed_kmh: 70.0,
            failures_remaining: AtomicUsize::new(0),
            always_fail: false,
            delay: None,
            traffic_factor: 1.0,
            calls: AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
impl MockRoutingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(road_coefficient: f64, average_speed_kmh: f64) -> Self {
        Self {
            road_coefficient,
            average_speed_kmh,
            ..Default::default()
        }
    }

    /// Provider that errors on every call
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    /// Fail the first `n` calls, then answer normally
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(n),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_traffic_factor(mut self, factor: f64) -> Self {
        self.traffic_factor = factor;
        self
    }

    /// Number of lookups received so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl RoutingProvider for MockRoutingProvider {
    async fn route_leg(&self, from: &Coordinates, to: &Coordinates, use_traffic: bool) -> Result<ProviderLeg> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_fail {
            anyhow::bail!("mock provider unavailable");
        }
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            anyhow::bail!("mock provider transient failure");
        }

        let distance_km = road_distance(from, to, self.road_coefficient);
        let free_flow = travel_time_minutes(distance_km, self.average_speed_kmh);
        Ok(ProviderLeg {
            distance_km,
            duration_minutes: if use_traffic { free_flow * self.traffic_factor } else { free_flow },
        })
    }

    fn name(&self) -> &str {
        "MockRouting"
    }
}

/// Create the routing provider from configuration.
///
/// Returns `None` when no provider URL is configured, which the estimator
/// treats as "provider disabled". A configured but unreachable Valhalla is
/// still returned: per-call fallbacks cover outages.
pub async fn create_routing_provider(valhalla_url: Option<String>) -> Result<Option<Arc<dyn RoutingProvider>>> {
    let Some(url) = valhalla_url else {
        info!("No routing provider configured, legs will use the haversine fallback");
        return Ok(None);
    };

    let client = ValhallaClient::new(ValhallaConfig::new(&url))?;

    match check_valhalla_health(&url).await {
        Ok(()) => info!("Valhalla routing service available at {}", url),
        Err(e) => warn!("Valhalla not reachable at {}: {}. Legs will fall back until it recovers.", url, e),
    }

    Ok(Some(Arc::new(client)))
}

/// Check if Valhalla is healthy by making a simple status request
async fn check_valhalla_health(base_url: &str) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    // Try the status endpoint
    let url = format!("{}/status", base_url);
    let response = client.get(&url).send().await?;

    if response.status().is_success() {
        Ok(())
    } else {
        anyhow::bail!("Valhalla returned status {}", response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owen_sound() -> Coordinates {
        Coordinates { lat: 44.5690, lng: -80.9406 }
    }

    fn toronto() -> Coordinates {
        Coordinates { lat: 43.6532, lng: -79.3832 }
    }

    #[tokio::test]
    async fn test_mock_routing_same_point_is_zero() {
        let provider = MockRoutingProvider::new();
        let leg = provider.route_leg(&owen_sound(), &owen_sound(), false).await.unwrap();

        assert_eq!(leg.distance_km, 0.0);
        assert_eq!(leg.duration_minutes, 0.0);
    }

    #[tokio::test]
    async fn test_mock_routing_is_symmetric() {
        let provider = MockRoutingProvider::new();
        let there = provider.route_leg(&owen_sound(), &toronto(), false).await.unwrap();
        let back = provider.route_leg(&toronto(), &owen_sound(), false).await.unwrap();

        assert!((there.distance_km - back.distance_km).abs() < 1e-9);
        assert!((there.duration_minutes - back.duration_minutes).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mock_routing_custom_params() {
        let provider = MockRoutingProvider::with_params(1.5, 60.0);
        let leg = provider.route_leg(&owen_sound(), &toronto(), false).await.unwrap();

        // ~160 km straight line × 1.5
        assert!(leg.distance_km > 220.0 && leg.distance_km < 260.0,
            "Expected ~240 km with 1.5 coefficient, got {} km", leg.distance_km);
        assert!((leg.duration_minutes - leg.distance_km).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_mock_routing_fails_first_calls() {
        let provider = MockRoutingProvider::failing_first(2);

        assert!(provider.route_leg(&owen_sound(), &toronto(), false).await.is_err());
        assert!(provider.route_leg(&owen_sound(), &toronto(), false).await.is_err());
        assert!(provider.route_leg(&owen_sound(), &toronto(), false).await.is_ok());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_mock_routing_failing_never_recovers() {
        let provider = MockRoutingProvider::failing();
        for _ in 0..3 {
            assert!(provider.route_leg(&owen_sound(), &toronto(), false).await.is_err());
        }
    }

    #[test]
    fn test_routing_provider_name() {
        let mock = MockRoutingProvider::new();
        assert_eq!(mock.name(), "MockRouting");
    }

    #[tokio::test]
    async fn test_create_routing_provider_without_url_is_disabled() {
        let provider = create_routing_provider(None).await.unwrap();
        assert!(provider.is_none());
    }

    #[tokio::test]
    async fn test_create_routing_provider_keeps_unreachable_valhalla() {
        let provider = create_routing_provider(Some("http://127.0.0.1:9".to_string()))
            .await
            .unwrap();
        assert_eq!(provider.map(|p| p.name().to_string()), Some("Valhalla".to_string()));
    }
}

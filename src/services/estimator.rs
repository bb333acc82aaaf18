//! Distance/duration estimation for route legs.
//!
//! One [`LegEstimator`] lives for the duration of a single generation. It asks
//! the routing provider for each leg with a per-call timeout and bounded
//! retries, caches answers by unordered coordinate pair and falls back to a
//! haversine approximation when the provider cannot answer in time.
//!
//! The generation deadline is fixed when the estimator is created and shared
//! by every batch it resolves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PlannerSettings;
use crate::defaults::PROVIDER_RETRY_BACKOFF;
use crate::services::geo::{road_distance, travel_time_minutes};
use crate::services::routing::RoutingProvider;
use crate::types::{ApproximationReason, Coordinates, Leg};

type PointKey = (u64, u64);

/// Unordered pair key, so A→B and B→A share one entry
fn pair_key(a: &Coordinates, b: &Coordinates) -> (PointKey, PointKey) {
    let (ka, kb) = (a.key(), b.key());
    if ka <= kb {
        (ka, kb)
    } else {
        (kb, ka)
    }
}

/// Estimator tunables for one generation
#[derive(Debug, Clone)]
pub struct EstimatorSettings {
    /// Straight-line to road distance factor for the fallback
    pub road_coefficient: f64,
    pub average_speed_kmh: f64,
    pub provider_timeout: Duration,
    /// Delay before each retry; its length is the retry count
    pub retry_backoff: Vec<Duration>,
    /// Overall budget for every lookup of one generation
    pub generation_timeout: Duration,
    pub max_in_flight: usize,
}

impl EstimatorSettings {
    pub fn from_planner(settings: &PlannerSettings, average_speed_kmh: f64, road_coefficient: f64) -> Self {
        Self {
            road_coefficient,
            average_speed_kmh,
            provider_timeout: settings.provider_timeout,
            retry_backoff: PROVIDER_RETRY_BACKOFF.to_vec(),
            generation_timeout: settings.generation_timeout,
            max_in_flight: settings.max_in_flight_lookups,
        }
    }
}

/// Symmetric matrix of legs between route points
#[derive(Debug, Clone, PartialEq)]
pub struct LegMatrix {
    size: usize,
    legs: Vec<Leg>,
}

impl LegMatrix {
    /// Build a matrix from a function evaluated for every `i < j`.
    pub fn from_fn(size: usize, mut leg: impl FnMut(usize, usize) -> Leg) -> Self {
        let mut legs = vec![Leg::zero(); size * size];
        for i in 0..size {
            for j in (i + 1)..size {
                let value = leg(i, j);
                legs[i * size + j] = value;
                legs[j * size + i] = value;
            }
        }
        Self { size, legs }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, from: usize, to: usize) -> Leg {
        self.legs[from * self.size + to]
    }

    /// Number of distinct legs that had to be approximated
    pub fn approximated(&self) -> usize {
        let mut count = 0;
        for i in 0..self.size {
            for j in (i + 1)..self.size {
                if self.get(i, j).approximation().is_some() {
                    count += 1;
                }
            }
        }
        count
    }
}

pub struct LegEstimator {
    provider: Option<Arc<dyn RoutingProvider>>,
    settings: EstimatorSettings,
    deadline: Instant,
    cache: Mutex<HashMap<(PointKey, PointKey), Leg>>,
}

impl LegEstimator {
    pub fn new(provider: Option<Arc<dyn RoutingProvider>>, settings: EstimatorSettings) -> Self {
        let deadline = Instant::now() + settings.generation_timeout;
        Self {
            provider,
            settings,
            deadline,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Instant after which no more provider lookups are started.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn road_coefficient(&self) -> f64 {
        self.settings.road_coefficient
    }

    /// Pre-populate the cache with a leg that is already known.
    pub fn seed(&self, from: &Coordinates, to: &Coordinates, leg: Leg) {
        self.cache.lock().insert(pair_key(from, to), leg);
    }

    fn cached(&self, from: &Coordinates, to: &Coordinates) -> Option<Leg> {
        self.cache.lock().get(&pair_key(from, to)).copied()
    }

    /// Deterministic haversine-based approximation
    pub fn fallback(&self, from: &Coordinates, to: &Coordinates, reason: ApproximationReason) -> Leg {
        let distance_km = road_distance(from, to, self.settings.road_coefficient);
        Leg::Approximate {
            distance_km,
            duration_minutes: travel_time_minutes(distance_km, self.settings.average_speed_kmh),
            reason,
        }
    }

    /// Resolve one leg. Never fails: provider problems yield an approximate leg.
    pub async fn estimate_leg(&self, from: &Coordinates, to: &Coordinates, use_traffic: bool) -> Leg {
        if from.key() == to.key() {
            return Leg::zero();
        }
        if let Some(leg) = self.cached(from, to) {
            return leg;
        }

        let leg = match &self.provider {
            Some(_) if Instant::now() >= self.deadline => {
                self.fallback(from, to, ApproximationReason::GenerationTimeout)
            }
            Some(provider) => self.lookup_with_retries(provider.as_ref(), from, to, use_traffic).await,
            None => self.fallback(from, to, ApproximationReason::ProviderDisabled),
        };

        self.seed(from, to, leg);
        leg
    }

    /// Deadline fallback for a pair nobody resolved; cached so later batches
    /// of the same generation do not ask the provider again.
    fn timed_out(&self, from: &Coordinates, to: &Coordinates) -> Leg {
        if let Some(leg) = self.cached(from, to) {
            return leg;
        }
        let leg = self.fallback(from, to, ApproximationReason::GenerationTimeout);
        self.seed(from, to, leg);
        leg
    }

    async fn lookup_with_retries(
        &self,
        provider: &dyn RoutingProvider,
        from: &Coordinates,
        to: &Coordinates,
        use_traffic: bool,
    ) -> Leg {
        let attempts = self.settings.retry_backoff.len() + 1;

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(self.settings.retry_backoff[attempt - 1]).await;
            }

            let call = provider.route_leg(from, to, use_traffic);
            match tokio::time::timeout(self.settings.provider_timeout, call).await {
                Ok(Ok(answer)) if is_usable(answer.distance_km) && is_usable(answer.duration_minutes) => {
                    return Leg::Exact {
                        distance_km: answer.distance_km,
                        duration_minutes: answer.duration_minutes,
                    };
                }
                Ok(Ok(answer)) => {
                    debug!(
                        "{} returned unusable leg ({} km, {} min), attempt {}/{}",
                        provider.name(), answer.distance_km, answer.duration_minutes, attempt + 1, attempts
                    );
                }
                Ok(Err(e)) => {
                    debug!("{} lookup failed, attempt {}/{}: {}", provider.name(), attempt + 1, attempts, e);
                }
                Err(_) => {
                    debug!("{} lookup timed out, attempt {}/{}", provider.name(), attempt + 1, attempts);
                }
            }
        }

        warn!(
            "{} unavailable for ({}, {}) -> ({}, {}), using approximation",
            provider.name(), from.lat, from.lng, to.lat, to.lng
        );
        self.fallback(from, to, ApproximationReason::ProviderUnavailable)
    }

    /// Resolve pairs concurrently under the generation deadline.
    ///
    /// Pairs still unresolved when the deadline fires are left out of the map.
    async fn resolve_pairs(
        &self,
        points: &[Coordinates],
        pairs: Vec<(usize, usize)>,
        use_traffic: bool,
    ) -> HashMap<(usize, usize), Leg> {
        let mut resolved = HashMap::with_capacity(pairs.len());
        let total = pairs.len();

        let mut lookups = stream::iter(pairs)
            .map(|(i, j)| async move { ((i, j), self.estimate_leg(&points[i], &points[j], use_traffic).await) })
            .buffer_unordered(self.settings.max_in_flight.max(1));

        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                next = lookups.next() => match next {
                    Some((pair, leg)) => {
                        resolved.insert(pair, leg);
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        "Generation deadline reached with {}/{} legs resolved",
                        resolved.len(), total
                    );
                    break;
                }
            }
        }

        resolved
    }

    /// Full symmetric matrix over `points`.
    pub async fn build_matrix(&self, points: &[Coordinates], use_traffic: bool) -> LegMatrix {
        let n = points.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .collect();

        debug!("Building leg matrix: {} points, {} pairs", n, pairs.len());
        let resolved = self.resolve_pairs(points, pairs, use_traffic).await;

        LegMatrix::from_fn(n, |i, j| {
            resolved
                .get(&(i, j))
                .copied()
                .unwrap_or_else(|| self.timed_out(&points[i], &points[j]))
        })
    }

    /// Legs between consecutive points of a fixed path.
    pub async fn legs_along(&self, path: &[Coordinates], use_traffic: bool) -> Vec<Leg> {
        let pairs: Vec<(usize, usize)> = (1..path.len()).map(|k| (k - 1, k)).collect();
        let resolved = self.resolve_pairs(path, pairs, use_traffic).await;

        (1..path.len())
            .map(|k| {
                resolved
                    .get(&(k - 1, k))
                    .copied()
                    .unwrap_or_else(|| self.timed_out(&path[k - 1], &path[k]))
            })
            .collect()
    }
}

fn is_usable(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

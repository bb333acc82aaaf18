//! Persistence seams for the planner.
//!
//! The Postgres implementations live in `db::store`; the in-memory ones here
//! back tests and the offline `plan` command.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{Load, NewRouteVersion, RouteFeedback, RouteVersion, VersionStatus};

/// Read-only access to loads and their destinations
#[async_trait]
pub trait LoadRegistry: Send + Sync {
    async fn get_load(&self, load_id: Uuid) -> Result<Option<Load>>;
}

/// Outcome of the compare-and-swap on a load's active pointer
#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    Activated { superseded: Option<Uuid> },
    /// The pointer did not hold the expected value
    PointerMoved { current: Option<Uuid> },
    /// The version changed status since it was read
    StatusChanged { status: VersionStatus },
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Persist a DRAFT, assigning the next number for its load atomically.
    async fn insert_version(&self, version: NewRouteVersion) -> Result<RouteVersion>;

    async fn get_version(&self, version_id: Uuid) -> Result<Option<RouteVersion>>;

    /// All versions of a load, ordered by version number
    async fn list_versions(&self, load_id: Uuid) -> Result<Vec<RouteVersion>>;

    async fn active_version_id(&self, load_id: Uuid) -> Result<Option<Uuid>>;

    /// Point the load at `version_id` if it currently points at `expected`,
    /// superseding the previous active version in the same step.
    async fn activate(
        &self,
        load_id: Uuid,
        version_id: Uuid,
        expected: Option<Uuid>,
        activated_at: DateTime<Utc>,
    ) -> Result<ActivationOutcome>;

    /// Conditional status change; false when the version is no longer in `from`.
    async fn transition(&self, version_id: Uuid, from: VersionStatus, to: VersionStatus) -> Result<bool>;
}

/// Which estimate a deviation refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviationMetric {
    Duration,
    Distance,
}

#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn insert_feedback(&self, feedback: &RouteFeedback) -> Result<()>;

    async fn list_feedback(&self, version_id: Uuid) -> Result<Vec<RouteFeedback>>;

    /// Most recent non-null deviations for a metric, newest first
    async fn recent_deviations(&self, metric: DeviationMetric, limit: usize) -> Result<Vec<f64>>;

    /// Most recent (road coefficient, distance deviation) pairs, newest first.
    /// Only feedback on fully approximated versions carries a coefficient.
    async fn recent_coefficient_samples(&self, limit: usize) -> Result<Vec<(f64, f64)>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLoadRegistry {
    loads: Mutex<HashMap<Uuid, Load>>,
}

impl InMemoryLoadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, load: Load) {
        self.loads.lock().insert(load.id, load);
    }
}

#[async_trait]
impl LoadRegistry for InMemoryLoadRegistry {
    async fn get_load(&self, load_id: Uuid) -> Result<Option<Load>> {
        Ok(self.loads.lock().get(&load_id).cloned())
    }
}

#[derive(Default)]
struct VersionTables {
    versions: HashMap<Uuid, RouteVersion>,
    /// load id -> (last version number, active version)
    loads: HashMap<Uuid, (i32, Option<Uuid>)>,
}

/// Versions and per-load state behind one mutex, so activation is a single
/// critical section.
#[derive(Default)]
pub struct InMemoryVersionStore {
    tables: Mutex<VersionTables>,
}

impl InMemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VersionStore for InMemoryVersionStore {
    async fn insert_version(&self, version: NewRouteVersion) -> Result<RouteVersion> {
        let mut tables = self.tables.lock();
        if tables.versions.contains_key(&version.id) {
            anyhow::bail!("route version {} already exists", version.id);
        }

        let state = tables.loads.entry(version.load_id).or_insert((0, None));
        state.0 += 1;
        let stored = version.into_draft(state.0);

        tables.versions.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_version(&self, version_id: Uuid) -> Result<Option<RouteVersion>> {
        Ok(self.tables.lock().versions.get(&version_id).cloned())
    }

    async fn list_versions(&self, load_id: Uuid) -> Result<Vec<RouteVersion>> {
        let tables = self.tables.lock();
        let mut versions: Vec<RouteVersion> = tables
            .versions
            .values()
            .filter(|v| v.load_id == load_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    async fn active_version_id(&self, load_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.tables.lock().loads.get(&load_id).and_then(|(_, active)| *active))
    }

    async fn activate(
        &self,
        load_id: Uuid,
        version_id: Uuid,
        expected: Option<Uuid>,
        activated_at: DateTime<Utc>,
    ) -> Result<ActivationOutcome> {
        let mut tables = self.tables.lock();

        let status = match tables.versions.get(&version_id) {
            Some(v) if v.load_id == load_id => v.status,
            _ => anyhow::bail!("route version {} does not belong to load {}", version_id, load_id),
        };
        if !status.can_activate() {
            return Ok(ActivationOutcome::StatusChanged { status });
        }

        let current = tables.loads.get(&load_id).and_then(|(_, active)| *active);
        if current != expected {
            return Ok(ActivationOutcome::PointerMoved { current });
        }

        if let Some(previous) = current {
            if let Some(v) = tables.versions.get_mut(&previous) {
                v.status = VersionStatus::Superseded;
            }
        }
        if let Some(v) = tables.versions.get_mut(&version_id) {
            v.status = VersionStatus::Active;
            v.activated_at = Some(activated_at);
        }
        tables.loads.entry(load_id).or_insert((0, None)).1 = Some(version_id);

        Ok(ActivationOutcome::Activated { superseded: current })
    }

    async fn transition(&self, version_id: Uuid, from: VersionStatus, to: VersionStatus) -> Result<bool> {
        let mut tables = self.tables.lock();
        match tables.versions.get_mut(&version_id) {
            Some(v) if v.status == from => {
                v.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryFeedbackStore {
    records: Mutex<Vec<RouteFeedback>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    async fn insert_feedback(&self, feedback: &RouteFeedback) -> Result<()> {
        self.records.lock().push(feedback.clone());
        Ok(())
    }

    async fn list_feedback(&self, version_id: Uuid) -> Result<Vec<RouteFeedback>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|f| f.version_id == version_id)
            .cloned()
            .collect())
    }

    async fn recent_deviations(&self, metric: DeviationMetric, limit: usize) -> Result<Vec<f64>> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .rev()
            .filter_map(|f| match metric {
                DeviationMetric::Duration => f.duration_deviation,
                DeviationMetric::Distance => f.distance_deviation,
            })
            .take(limit)
            .collect())
    }

    async fn recent_coefficient_samples(&self, limit: usize) -> Result<Vec<(f64, f64)>> {
        let records = self.records.lock();
        Ok(records
            .iter()
            .rev()
            .filter_map(|f| Some((f.road_coefficient?, f.distance_deviation?)))
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GenerationSource, OptimizationConstraints, RouteMetrics};

    fn new_version(load_id: Uuid) -> NewRouteVersion {
        NewRouteVersion {
            id: Uuid::new_v4(),
            load_id,
            stops: vec![],
            metrics: RouteMetrics::default(),
            return_leg: None,
            source: GenerationSource::AiGenerated,
            derived_from_version_id: None,
            reason: None,
            constraints: OptimizationConstraints::default(),
            departure: chrono::NaiveDate::from_ymd_opt(2025, 3, 3)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
            warnings: vec![],
            load_fingerprint: "fp".to_string(),
            road_coefficient: 1.3,
            created_at: Utc::now(),
            created_by: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_version_numbers_increase_per_load() {
        let store = InMemoryVersionStore::new();
        let load_a = Uuid::from_u128(1);
        let load_b = Uuid::from_u128(2);

        let a1 = store.insert_version(new_version(load_a)).await.unwrap();
        let a2 = store.insert_version(new_version(load_a)).await.unwrap();
        let b1 = store.insert_version(new_version(load_b)).await.unwrap();

        assert_eq!((a1.version_number, a2.version_number, b1.version_number), (1, 2, 1));
        assert_eq!(a1.status, VersionStatus::Draft);
    }

    #[tokio::test]
    async fn test_activate_supersedes_previous() {
        let store = InMemoryVersionStore::new();
        let load = Uuid::from_u128(1);
        let v1 = store.insert_version(new_version(load)).await.unwrap();
        let v2 = store.insert_version(new_version(load)).await.unwrap();

        let first = store.activate(load, v1.id, None, Utc::now()).await.unwrap();
        assert_eq!(first, ActivationOutcome::Activated { superseded: None });

        let second = store.activate(load, v2.id, Some(v1.id), Utc::now()).await.unwrap();
        assert_eq!(second, ActivationOutcome::Activated { superseded: Some(v1.id) });

        let v1 = store.get_version(v1.id).await.unwrap().unwrap();
        let v2 = store.get_version(v2.id).await.unwrap().unwrap();
        assert_eq!(v1.status, VersionStatus::Superseded);
        assert_eq!(v2.status, VersionStatus::Active);
        assert!(v2.activated_at.is_some());
        assert_eq!(store.active_version_id(load).await.unwrap(), Some(v2.id));
    }

    #[tokio::test]
    async fn test_activate_with_stale_expectation_is_rejected() {
        let store = InMemoryVersionStore::new();
        let load = Uuid::from_u128(1);
        let v1 = store.insert_version(new_version(load)).await.unwrap();
        let v2 = store.insert_version(new_version(load)).await.unwrap();

        store.activate(load, v1.id, None, Utc::now()).await.unwrap();
        let outcome = store.activate(load, v2.id, None, Utc::now()).await.unwrap();

        assert_eq!(outcome, ActivationOutcome::PointerMoved { current: Some(v1.id) });
        let v2 = store.get_version(v2.id).await.unwrap().unwrap();
        assert_eq!(v2.status, VersionStatus::Draft);
    }

    #[tokio::test]
    async fn test_transition_is_conditional() {
        let store = InMemoryVersionStore::new();
        let v = store.insert_version(new_version(Uuid::from_u128(1))).await.unwrap();

        assert!(store.transition(v.id, VersionStatus::Draft, VersionStatus::Discarded).await.unwrap());
        assert!(!store.transition(v.id, VersionStatus::Draft, VersionStatus::Discarded).await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_deviations_newest_first_skipping_missing() {
        let store = InMemoryFeedbackStore::new();
        for (i, deviation) in [Some(0.1), None, Some(0.3)].into_iter().enumerate() {
            store
                .insert_feedback(&RouteFeedback {
                    id: Uuid::from_u128(i as u128),
                    version_id: Uuid::from_u128(9),
                    rating: 4,
                    comments: String::new(),
                    actual_duration_minutes: None,
                    actual_distance_km: None,
                    issues: vec![],
                    duration_deviation: deviation,
                    distance_deviation: deviation,
                    road_coefficient: (i == 0).then_some(1.3),
                    recorded_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let recent = store.recent_deviations(DeviationMetric::Duration, 50).await.unwrap();
        assert_eq!(recent, vec![0.3, 0.1]);
        assert_eq!(
            store.recent_coefficient_samples(50).await.unwrap(),
            vec![(1.3, 0.1)]
        );
        assert_eq!(store.list_feedback(Uuid::from_u128(9)).await.unwrap().len(), 3);
    }
}

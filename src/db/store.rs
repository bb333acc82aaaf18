//! Postgres-backed planner stores

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::queries;
use crate::services::store::{
    ActivationOutcome, DeviationMetric, FeedbackStore, LoadRegistry, VersionStore,
};
use crate::types::{Load, NewRouteVersion, RouteFeedback, RouteVersion, VersionStatus};

/// One pool serving loads, versions and feedback
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LoadRegistry for PgStore {
    async fn get_load(&self, load_id: Uuid) -> Result<Option<Load>> {
        queries::loads::get_load(&self.pool, load_id).await
    }
}

#[async_trait]
impl VersionStore for PgStore {
    async fn insert_version(&self, version: NewRouteVersion) -> Result<RouteVersion> {
        queries::versions::insert_version(&self.pool, version).await
    }

    async fn get_version(&self, version_id: Uuid) -> Result<Option<RouteVersion>> {
        queries::versions::get_version(&self.pool, version_id).await
    }

    async fn list_versions(&self, load_id: Uuid) -> Result<Vec<RouteVersion>> {
        queries::versions::list_versions(&self.pool, load_id).await
    }

    async fn active_version_id(&self, load_id: Uuid) -> Result<Option<Uuid>> {
        queries::versions::active_version_id(&self.pool, load_id).await
    }

    async fn activate(
        &self,
        load_id: Uuid,
        version_id: Uuid,
        expected: Option<Uuid>,
        activated_at: DateTime<Utc>,
    ) -> Result<ActivationOutcome> {
        queries::versions::activate(&self.pool, load_id, version_id, expected, activated_at).await
    }

    async fn transition(&self, version_id: Uuid, from: VersionStatus, to: VersionStatus) -> Result<bool> {
        queries::versions::transition(&self.pool, version_id, from, to).await
    }
}

#[async_trait]
impl FeedbackStore for PgStore {
    async fn insert_feedback(&self, feedback: &RouteFeedback) -> Result<()> {
        queries::feedback::insert_feedback(&self.pool, feedback).await
    }

    async fn list_feedback(&self, version_id: Uuid) -> Result<Vec<RouteFeedback>> {
        queries::feedback::list_feedback(&self.pool, version_id).await
    }

    async fn recent_deviations(&self, metric: DeviationMetric, limit: usize) -> Result<Vec<f64>> {
        queries::feedback::recent_deviations(&self.pool, metric, limit).await
    }

    async fn recent_coefficient_samples(&self, limit: usize) -> Result<Vec<(f64, f64)>> {
        queries::feedback::recent_coefficient_samples(&self.pool, limit).await
    }
}

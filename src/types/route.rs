//! Route types: constraints, legs, stops and versions

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Destination;
use crate::defaults::AVERAGE_SPEED_BOUNDS_KMH;
use crate::error::{PlannerError, PlannerResult};

/// Optimization constraints for one route generation.
///
/// Every recognized option is an explicit field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationConstraints {
    pub max_daily_driving_hours: f64,
    pub average_speed_kmh: f64,
    /// Per-stop dwell time
    pub delivery_time_minutes: f64,
    #[serde(default)]
    pub include_return_trip: bool,
    #[serde(default)]
    pub prioritize_fuel_efficiency: bool,
    #[serde(default)]
    pub check_traffic_conditions: bool,
    #[serde(default)]
    pub avoid_severe_weather: bool,
}

impl Default for OptimizationConstraints {
    fn default() -> Self {
        Self {
            max_daily_driving_hours: 10.0,
            average_speed_kmh: 80.0,
            delivery_time_minutes: 30.0,
            include_return_trip: false,
            prioritize_fuel_efficiency: false,
            check_traffic_conditions: false,
            avoid_severe_weather: false,
        }
    }
}

impl OptimizationConstraints {
    pub fn validate(&self) -> PlannerResult<()> {
        if !self.max_daily_driving_hours.is_finite() || self.max_daily_driving_hours <= 0.0 {
            return Err(PlannerError::validation(format!(
                "maxDailyDrivingHours must be > 0 (got {})",
                self.max_daily_driving_hours
            )));
        }
        if self.max_daily_driving_hours > 24.0 {
            return Err(PlannerError::validation(format!(
                "maxDailyDrivingHours cannot exceed 24 (got {})",
                self.max_daily_driving_hours
            )));
        }
        let (min_speed, max_speed) = AVERAGE_SPEED_BOUNDS_KMH;
        if !(min_speed..=max_speed).contains(&self.average_speed_kmh) {
            return Err(PlannerError::validation(format!(
                "averageSpeedKmh must be between {} and {} (got {})",
                min_speed, max_speed, self.average_speed_kmh
            )));
        }
        if !self.delivery_time_minutes.is_finite() || self.delivery_time_minutes < 0.0 {
            return Err(PlannerError::validation(format!(
                "deliveryTimeMinutes must be >= 0 (got {})",
                self.delivery_time_minutes
            )));
        }
        Ok(())
    }

    pub fn daily_driving_budget_minutes(&self) -> f64 {
        self.max_daily_driving_hours * 60.0
    }

    pub const fn needs_conditions(&self) -> bool {
        self.check_traffic_conditions || self.avoid_severe_weather
    }
}

/// Why a leg had to be approximated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproximationReason {
    ProviderUnavailable,
    ProviderDisabled,
    GenerationTimeout,
}

impl ApproximationReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            ApproximationReason::ProviderUnavailable => "provider_unavailable",
            ApproximationReason::ProviderDisabled => "provider_disabled",
            ApproximationReason::GenerationTimeout => "generation_timeout",
        }
    }
}

/// Distance/duration estimate between two points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "quality", rename_all = "snake_case")]
pub enum Leg {
    #[serde(rename_all = "camelCase")]
    Exact {
        distance_km: f64,
        duration_minutes: f64,
    },
    #[serde(rename_all = "camelCase")]
    Approximate {
        distance_km: f64,
        duration_minutes: f64,
        reason: ApproximationReason,
    },
}

impl Leg {
    pub const fn zero() -> Self {
        Leg::Exact {
            distance_km: 0.0,
            duration_minutes: 0.0,
        }
    }

    pub fn distance_km(&self) -> f64 {
        match *self {
            Leg::Exact { distance_km, .. } | Leg::Approximate { distance_km, .. } => distance_km,
        }
    }

    pub fn duration_minutes(&self) -> f64 {
        match *self {
            Leg::Exact { duration_minutes, .. } | Leg::Approximate { duration_minutes, .. } => {
                duration_minutes
            }
        }
    }

    pub fn approximation(&self) -> Option<ApproximationReason> {
        match *self {
            Leg::Exact { .. } => None,
            Leg::Approximate { reason, .. } => Some(reason),
        }
    }
}

/// One destination's position within a scheduled route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub sequence: u32,
    pub destination: Destination,
    pub incoming_leg: Leg,
    pub dwell_minutes: f64,
    pub cumulative_distance_km: f64,
    /// Driving plus dwell minutes before arrival; overnight rest excluded
    pub cumulative_duration_minutes: f64,
    pub day_index: u32,
    pub estimated_arrival: NaiveDateTime,
}

/// Aggregate metrics of a scheduled route
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetrics {
    pub total_distance_km: f64,
    pub total_duration_minutes: f64,
    pub total_days: u32,
    pub estimated_completion: Option<NaiveDateTime>,
}

/// Route version status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "route_version_status", rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Active,
    Superseded,
    Discarded,
}

impl VersionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Draft => "draft",
            VersionStatus::Active => "active",
            VersionStatus::Superseded => "superseded",
            VersionStatus::Discarded => "discarded",
        }
    }

    pub const fn can_activate(self) -> bool {
        matches!(self, VersionStatus::Draft | VersionStatus::Superseded)
    }

    pub const fn can_discard(self) -> bool {
        matches!(self, VersionStatus::Draft | VersionStatus::Superseded)
    }

    /// Versions that were executed at some point accept feedback.
    pub const fn accepts_feedback(self) -> bool {
        matches!(self, VersionStatus::Active | VersionStatus::Superseded)
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a version came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "route_generation_source", rename_all = "snake_case")]
pub enum GenerationSource {
    AiGenerated,
    ManualModification,
}

impl GenerationSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            GenerationSource::AiGenerated => "ai_generated",
            GenerationSource::ManualModification => "manual_modification",
        }
    }
}

/// Non-fatal warning attached to a version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteWarning {
    pub stop_index: Option<u32>,
    pub warning_type: String,
    pub message: String,
}

impl RouteWarning {
    pub const ESTIMATION_DEGRADED: &'static str = "ESTIMATION_DEGRADED";
    pub const LEG_EXCEEDS_DAILY_BUDGET: &'static str = "LEG_EXCEEDS_DAILY_BUDGET";

    pub fn new(stop_index: Option<u32>, warning_type: &str, message: impl Into<String>) -> Self {
        Self {
            stop_index,
            warning_type: warning_type.to_string(),
            message: message.into(),
        }
    }
}

/// Immutable, numbered snapshot of a computed or modified route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteVersion {
    pub id: Uuid,
    pub load_id: Uuid,
    pub version_number: i32,
    pub status: VersionStatus,
    pub stops: Vec<Stop>,
    pub metrics: RouteMetrics,
    /// Leg from the last stop back to the origin, when a return trip was requested
    pub return_leg: Option<Leg>,
    pub source: GenerationSource,
    pub derived_from_version_id: Option<Uuid>,
    pub reason: Option<String>,
    pub constraints: OptimizationConstraints,
    pub departure: NaiveDateTime,
    pub warnings: Vec<RouteWarning>,
    pub load_fingerprint: String,
    /// Straight-line to road factor behind this version's approximate legs
    pub road_coefficient: f64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub activated_at: Option<DateTime<Utc>>,
}

impl RouteVersion {
    pub fn is_degraded(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| w.warning_type == RouteWarning::ESTIMATION_DEGRADED)
    }

    /// True when every leg with distance was approximated, so the total
    /// distance is a direct product of `road_coefficient`.
    pub fn distance_is_approximated(&self) -> bool {
        let mut legs = self
            .stops
            .iter()
            .map(|s| s.incoming_leg)
            .chain(self.return_leg)
            .filter(|leg| leg.distance_km() > 0.0)
            .peekable();
        legs.peek().is_some() && legs.all(|leg| leg.approximation().is_some())
    }
}

/// Everything needed to persist a version except the store-assigned number
#[derive(Debug, Clone, PartialEq)]
pub struct NewRouteVersion {
    pub id: Uuid,
    pub load_id: Uuid,
    pub stops: Vec<Stop>,
    pub metrics: RouteMetrics,
    pub return_leg: Option<Leg>,
    pub source: GenerationSource,
    pub derived_from_version_id: Option<Uuid>,
    pub reason: Option<String>,
    pub constraints: OptimizationConstraints,
    pub departure: NaiveDateTime,
    pub warnings: Vec<RouteWarning>,
    pub load_fingerprint: String,
    pub road_coefficient: f64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl NewRouteVersion {
    /// Materialize as a DRAFT with the number assigned by the store.
    pub fn into_draft(self, version_number: i32) -> RouteVersion {
        RouteVersion {
            id: self.id,
            load_id: self.load_id,
            version_number,
            status: VersionStatus::Draft,
            stops: self.stops,
            metrics: self.metrics,
            return_leg: self.return_leg,
            source: self.source,
            derived_from_version_id: self.derived_from_version_id,
            reason: self.reason,
            constraints: self.constraints,
            departure: self.departure,
            warnings: self.warnings,
            load_fingerprint: self.load_fingerprint,
            road_coefficient: self.road_coefficient,
            created_at: self.created_at,
            created_by: self.created_by,
            activated_at: None,
        }
    }
}

//! Route version lifecycle: generate, modify, activate, discard, compare.
//!
//! Versions are immutable once persisted; only their status moves, and only
//! along DRAFT -> ACTIVE -> SUPERSEDED, with DISCARDED reachable from DRAFT
//! and SUPERSEDED. The per-load active pointer is changed with a single
//! compare-and-swap in the store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PlannerSettings;
use crate::error::{PlannerError, PlannerResult};
use crate::services::conditions::{conditions_for_points, ConditionsProvider, RoadConditions};
use crate::services::estimator::{EstimatorSettings, LegEstimator};
use crate::services::feedback::FeedbackAggregator;
use crate::services::routing::RoutingProvider;
use crate::services::scheduler::{schedule, Schedule, ScheduleStop};
use crate::services::sequencer::{check_capacity, Sequencer};
use crate::services::store::{ActivationOutcome, LoadRegistry, VersionStore};
use crate::types::{
    ActivationResult, Coordinates, Destination, GenerateRouteRequest, GenerationSource, Load,
    ModifyRouteRequest, NewRouteVersion, OptimizationConstraints, ReorderedStop, RouteModification,
    RouteVersion, RouteWarning, StopPresence, VersionComparison, VersionStatus,
};

/// Destination with the dwell it will get, while a modification is applied
#[derive(Debug, Clone)]
struct WorkingStop {
    destination: Destination,
    dwell_minutes: f64,
}

pub struct RouteVersionManager {
    loads: Arc<dyn LoadRegistry>,
    versions: Arc<dyn VersionStore>,
    feedback: Arc<FeedbackAggregator>,
    routing: Option<Arc<dyn RoutingProvider>>,
    conditions: Option<Arc<dyn ConditionsProvider>>,
    settings: PlannerSettings,
}

impl RouteVersionManager {
    pub fn new(
        loads: Arc<dyn LoadRegistry>,
        versions: Arc<dyn VersionStore>,
        feedback: Arc<FeedbackAggregator>,
        routing: Option<Arc<dyn RoutingProvider>>,
        conditions: Option<Arc<dyn ConditionsProvider>>,
        settings: PlannerSettings,
    ) -> Self {
        Self {
            loads,
            versions,
            feedback,
            routing,
            conditions,
            settings,
        }
    }

    pub fn feedback(&self) -> &FeedbackAggregator {
        &self.feedback
    }

    async fn load(&self, load_id: Uuid) -> PlannerResult<Load> {
        let mut load = self
            .loads
            .get_load(load_id)
            .await?
            .ok_or_else(|| PlannerError::load_not_found(load_id))?;
        load.active_version_id = self.versions.active_version_id(load_id).await?;
        Ok(load)
    }

    async fn version(&self, version_id: Uuid) -> PlannerResult<RouteVersion> {
        self.versions
            .get_version(version_id)
            .await?
            .ok_or_else(|| PlannerError::version_not_found(version_id))
    }

    /// Next day start in local time, or today's if it is still ahead
    fn default_departure(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        let today = now.date().and_time(self.settings.day_start);
        if today > now {
            today
        } else {
            now.date().succ_opt().unwrap_or(now.date()).and_time(self.settings.day_start)
        }
    }

    async fn road_coefficient(&self) -> PlannerResult<f64> {
        if !self.settings.feedback_calibration {
            return Ok(self.settings.road_coefficient);
        }
        Ok(self.feedback.calibration().await?.suggested_road_coefficient)
    }

    fn estimator(&self, constraints: &OptimizationConstraints, road_coefficient: f64) -> LegEstimator {
        LegEstimator::new(
            self.routing.clone(),
            EstimatorSettings::from_planner(&self.settings, constraints.average_speed_kmh, road_coefficient),
        )
    }

    /// Conditions per point, bounded by the generation deadline. Past the
    /// deadline the sequencer gets none and treats every level as unknown.
    async fn point_conditions(
        &self,
        estimator: &LegEstimator,
        points: &[Coordinates],
        constraints: &OptimizationConstraints,
    ) -> Vec<RoadConditions> {
        if !constraints.needs_conditions() {
            return Vec::new();
        }
        let lookups = conditions_for_points(
            self.conditions.as_deref(),
            points,
            self.settings.max_in_flight_lookups,
            self.settings.provider_timeout,
        );
        match tokio::time::timeout_at(estimator.deadline(), lookups).await {
            Ok(conditions) => conditions,
            Err(_) => {
                warn!("Generation deadline reached before conditions for {} points", points.len());
                Vec::new()
            }
        }
    }

    /// Sequence and schedule `stops` (already in supply order).
    async fn plan(
        &self,
        estimator: &LegEstimator,
        origin: Coordinates,
        mut stops: Vec<WorkingStop>,
        resequence: bool,
        departure: NaiveDateTime,
        constraints: &OptimizationConstraints,
    ) -> PlannerResult<Schedule> {
        let use_traffic = constraints.check_traffic_conditions;

        if resequence && stops.len() > 1 {
            let points: Vec<Coordinates> = std::iter::once(origin)
                .chain(stops.iter().map(|s| s.destination.coordinates))
                .collect();
            let matrix = estimator.build_matrix(&points, use_traffic).await;
            debug!(
                "Leg matrix for {} points built, {} legs approximated",
                matrix.size(),
                matrix.approximated()
            );
            let conditions = self.point_conditions(estimator, &points, constraints).await;
            let order = Sequencer::new(&matrix, &conditions, constraints).sequence(self.settings.max_destinations)?;

            let mut slots: Vec<Option<WorkingStop>> = stops.into_iter().map(Some).collect();
            stops = order.into_iter().filter_map(|i| slots[i].take()).collect();
        }

        let mut path: Vec<Coordinates> = std::iter::once(origin)
            .chain(stops.iter().map(|s| s.destination.coordinates))
            .collect();
        if constraints.include_return_trip && !stops.is_empty() {
            path.push(origin);
        }
        let mut legs = estimator.legs_along(&path, use_traffic).await;

        let return_leg = if constraints.include_return_trip && !stops.is_empty() {
            legs.pop()
        } else {
            None
        };

        let schedule_stops: Vec<ScheduleStop> = stops
            .into_iter()
            .zip(legs)
            .map(|(stop, leg)| ScheduleStop {
                destination: stop.destination,
                incoming_leg: leg,
                dwell_minutes: stop.dwell_minutes,
            })
            .collect();

        let mut result = schedule(&schedule_stops, return_leg, departure, constraints, self.settings.day_start)?;
        let degraded = degradation_warnings(&result);
        result.warnings.extend(degraded);
        Ok(result)
    }

    /// Run the pipeline for a load and persist a new DRAFT.
    pub async fn generate(
        &self,
        request: GenerateRouteRequest,
        cancel: &CancellationToken,
    ) -> PlannerResult<RouteVersion> {
        let load_id = request.load_id;
        let constraints = request.constraints;
        constraints.validate().map_err(|e| e.for_load(load_id))?;

        let load = self.load(load_id).await?;
        check_capacity(load.destinations.len(), self.settings.max_destinations).map_err(|e| e.for_load(load_id))?;
        if let Some(index) = load.destinations.iter().position(|d| !d.coordinates.is_valid()) {
            return Err(PlannerError::validation(format!(
                "destination {} has invalid coordinates",
                load.destinations[index].id
            ))
            .for_load(load_id)
            .at_leg(index));
        }

        let departure = request.departure.unwrap_or_else(|| self.default_departure());
        let estimator = self.estimator(&constraints, self.road_coefficient().await?);

        let stops: Vec<WorkingStop> = load
            .destinations
            .iter()
            .map(|d| WorkingStop {
                destination: d.clone(),
                dwell_minutes: constraints.delivery_time_minutes,
            })
            .collect();

        let planning = self.plan(&estimator, load.origin, stops, true, departure, &constraints);
        let planned = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = planning => Some(result),
        };
        let Some(planned) = planned else {
            warn!("Route generation for load {} cancelled", load_id);
            return Err(PlannerError::Cancelled { load_id });
        };
        let planned = planned.map_err(|e| e.for_load(load_id))?;

        if cancel.is_cancelled() {
            return Err(PlannerError::Cancelled { load_id });
        }

        let version = self
            .versions
            .insert_version(NewRouteVersion {
                id: Uuid::new_v4(),
                load_id,
                stops: planned.stops,
                metrics: planned.metrics,
                return_leg: planned.return_leg,
                source: GenerationSource::AiGenerated,
                derived_from_version_id: None,
                reason: None,
                constraints,
                departure,
                warnings: planned.warnings,
                load_fingerprint: load.fingerprint(),
                road_coefficient: estimator.road_coefficient(),
                created_at: Utc::now(),
                created_by: request.created_by,
            })
            .await?;

        info!(
            "Generated route version {} (#{}) for load {}: {} stops, {:.1} km, {} days{}",
            version.id,
            version.version_number,
            load_id,
            version.stops.len(),
            version.metrics.total_distance_km,
            version.metrics.total_days,
            if version.is_degraded() { ", degraded" } else { "" }
        );

        Ok(version)
    }

    /// Derive a new DRAFT from an existing version.
    pub async fn modify(
        &self,
        request: ModifyRouteRequest,
        cancel: &CancellationToken,
    ) -> PlannerResult<RouteVersion> {
        let source = self.version(request.version_id).await?;
        if source.status == VersionStatus::Discarded {
            return Err(PlannerError::InvalidTransition {
                version_id: source.id,
                from: source.status,
                action: "modify",
            });
        }
        if request.reason.trim().is_empty() {
            return Err(PlannerError::validation("a reason is required to modify a route").for_version(source.id));
        }

        let load = self.load(source.load_id).await?;
        if load.fingerprint() != source.load_fingerprint {
            return Err(PlannerError::conflict(
                load.id,
                Some(source.id),
                "load destinations changed since this version was generated",
            ));
        }

        let mut stops: Vec<WorkingStop> = source
            .stops
            .iter()
            .map(|s| WorkingStop {
                destination: s.destination.clone(),
                dwell_minutes: s.dwell_minutes,
            })
            .collect();
        for modification in &request.modifications {
            apply_modification(&mut stops, modification, source.constraints.delivery_time_minutes)
                .map_err(|e| e.for_version(source.id).for_load(source.load_id))?;
        }
        check_capacity(stops.len(), self.settings.max_destinations).map_err(|e| e.for_version(source.id))?;

        // Keep the source's factor so reused and new approximate legs agree
        let estimator = self.estimator(&source.constraints, source.road_coefficient);
        seed_known_legs(&estimator, load.origin, &source);

        let planning = self.plan(
            &estimator,
            load.origin,
            stops,
            request.resequence,
            source.departure,
            &source.constraints,
        );
        let planned = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = planning => Some(result),
        };
        let Some(planned) = planned else {
            warn!("Modification of version {} cancelled", source.id);
            return Err(PlannerError::Cancelled { load_id: source.load_id });
        };
        let planned = planned.map_err(|e| e.for_version(source.id))?;

        if cancel.is_cancelled() {
            return Err(PlannerError::Cancelled { load_id: source.load_id });
        }

        let version = self
            .versions
            .insert_version(NewRouteVersion {
                id: Uuid::new_v4(),
                load_id: source.load_id,
                stops: planned.stops,
                metrics: planned.metrics,
                return_leg: planned.return_leg,
                source: GenerationSource::ManualModification,
                derived_from_version_id: Some(source.id),
                reason: Some(request.reason),
                constraints: source.constraints.clone(),
                departure: source.departure,
                warnings: planned.warnings,
                load_fingerprint: source.load_fingerprint.clone(),
                road_coefficient: estimator.road_coefficient(),
                created_at: Utc::now(),
                created_by: request.created_by,
            })
            .await?;

        info!(
            "Derived route version {} (#{}) from {} with {} modifications",
            version.id,
            version.version_number,
            source.id,
            request.modifications.len()
        );

        Ok(version)
    }

    /// Activate, superseding whatever is active now.
    pub async fn activate(&self, version_id: Uuid) -> PlannerResult<ActivationResult> {
        let version = self.version(version_id).await?;
        let current = self.versions.active_version_id(version.load_id).await?;
        self.activate_version(version, current).await
    }

    /// Activate only if the load's active version is still `expected`.
    pub async fn activate_if(&self, version_id: Uuid, expected: Option<Uuid>) -> PlannerResult<ActivationResult> {
        let version = self.version(version_id).await?;
        self.activate_version(version, expected).await
    }

    async fn activate_version(&self, version: RouteVersion, expected: Option<Uuid>) -> PlannerResult<ActivationResult> {
        if !version.status.can_activate() {
            return Err(PlannerError::InvalidTransition {
                version_id: version.id,
                from: version.status,
                action: "activate",
            });
        }

        let load = self.load(version.load_id).await?;
        if load.fingerprint() != version.load_fingerprint {
            return Err(PlannerError::conflict(
                load.id,
                Some(version.id),
                "load destinations changed since this version was generated",
            ));
        }

        let outcome = self
            .versions
            .activate(load.id, version.id, expected, Utc::now())
            .await?;

        match outcome {
            ActivationOutcome::Activated { superseded } => {
                info!(
                    "Activated route version {} for load {} (superseded {:?})",
                    version.id, load.id, superseded
                );
                Ok(ActivationResult {
                    load_id: load.id,
                    activated_version_id: version.id,
                    superseded_version_id: superseded,
                })
            }
            ActivationOutcome::PointerMoved { current } => {
                warn!(
                    "Activation of {} lost the race on load {}: expected {:?}, found {:?}",
                    version.id, load.id, expected, current
                );
                Err(PlannerError::conflict(
                    load.id,
                    Some(version.id),
                    "active version changed concurrently",
                ))
            }
            ActivationOutcome::StatusChanged { status } => Err(PlannerError::InvalidTransition {
                version_id: version.id,
                from: status,
                action: "activate",
            }),
        }
    }

    pub async fn discard(&self, version_id: Uuid) -> PlannerResult<RouteVersion> {
        let version = self.version(version_id).await?;
        if !version.status.can_discard() {
            return Err(PlannerError::InvalidTransition {
                version_id,
                from: version.status,
                action: "discard",
            });
        }

        let changed = self
            .versions
            .transition(version_id, version.status, VersionStatus::Discarded)
            .await?;
        if !changed {
            return Err(PlannerError::conflict(
                version.load_id,
                Some(version_id),
                "version status changed concurrently",
            ));
        }

        info!("Discarded route version {} of load {}", version_id, version.load_id);
        self.version(version_id).await
    }

    pub async fn compare(&self, version_a: Uuid, version_b: Uuid) -> PlannerResult<VersionComparison> {
        let a = self.version(version_a).await?;
        let b = self.version(version_b).await?;
        if a.load_id != b.load_id {
            return Err(PlannerError::validation("only versions of the same load can be compared")
                .for_version(version_b));
        }
        Ok(compare_versions(&a, &b))
    }

    pub async fn list_versions(&self, load_id: Uuid) -> PlannerResult<Vec<RouteVersion>> {
        // Unknown loads are an error, not an empty history
        self.loads
            .get_load(load_id)
            .await?
            .ok_or_else(|| PlannerError::load_not_found(load_id))?;
        Ok(self.versions.list_versions(load_id).await?)
    }

    pub async fn get_version(&self, version_id: Uuid) -> PlannerResult<RouteVersion> {
        self.version(version_id).await
    }

    pub async fn get_active(&self, load_id: Uuid) -> PlannerResult<Option<RouteVersion>> {
        let load = self.load(load_id).await?;
        match load.active_version_id {
            Some(id) => Ok(self.versions.get_version(id).await?),
            None => Ok(None),
        }
    }

    /// Current conditions at a point, degraded to unknown on failure
    pub async fn conditions_at(&self, point: Coordinates) -> PlannerResult<RoadConditions> {
        if !point.is_valid() {
            return Err(PlannerError::validation(format!(
                "invalid coordinates ({}, {})",
                point.lat, point.lng
            )));
        }
        let conditions = conditions_for_points(
            self.conditions.as_deref(),
            &[point],
            1,
            self.settings.provider_timeout,
        )
        .await;
        Ok(conditions.into_iter().next().unwrap_or_default())
    }
}

/// Reuse legs of the source version so unchanged neighbours need no lookup
fn seed_known_legs(estimator: &LegEstimator, origin: Coordinates, source: &RouteVersion) {
    let mut previous = origin;
    for stop in &source.stops {
        estimator.seed(&previous, &stop.destination.coordinates, stop.incoming_leg);
        previous = stop.destination.coordinates;
    }
    if let Some(leg) = source.return_leg {
        estimator.seed(&previous, &origin, leg);
    }
}

fn degradation_warnings(schedule: &Schedule) -> Vec<RouteWarning> {
    let mut warnings: Vec<RouteWarning> = schedule
        .stops
        .iter()
        .filter_map(|stop| {
            stop.incoming_leg.approximation().map(|reason| {
                RouteWarning::new(
                    Some(stop.sequence),
                    RouteWarning::ESTIMATION_DEGRADED,
                    format!("leg to {} is approximate ({})", stop.destination.address, reason.as_str()),
                )
            })
        })
        .collect();

    if let Some(reason) = schedule.return_leg.and_then(|leg| leg.approximation()) {
        warnings.push(RouteWarning::new(
            None,
            RouteWarning::ESTIMATION_DEGRADED,
            format!("return leg is approximate ({})", reason.as_str()),
        ));
    }
    warnings
}

fn find_stop(stops: &[WorkingStop], destination_id: Uuid) -> PlannerResult<usize> {
    stops
        .iter()
        .position(|s| s.destination.id == destination_id)
        .ok_or_else(|| PlannerError::validation(format!("destination {} is not on this route", destination_id)))
}

fn apply_modification(
    stops: &mut Vec<WorkingStop>,
    modification: &RouteModification,
    default_dwell: f64,
) -> PlannerResult<()> {
    match modification {
        RouteModification::Reorder { destination_ids } => {
            let unique: HashSet<&Uuid> = destination_ids.iter().collect();
            if destination_ids.len() != stops.len() || unique.len() != stops.len() {
                return Err(PlannerError::validation(
                    "reorder must list every destination on the route exactly once",
                ));
            }
            let mut by_id: HashMap<Uuid, WorkingStop> =
                stops.drain(..).map(|s| (s.destination.id, s)).collect();
            let mut reordered = Vec::with_capacity(destination_ids.len());
            for id in destination_ids {
                match by_id.remove(id) {
                    Some(stop) => reordered.push(stop),
                    None => {
                        return Err(PlannerError::validation(format!(
                            "destination {} is not on this route",
                            id
                        )))
                    }
                }
            }
            *stops = reordered;
        }
        RouteModification::MoveStop { destination_id, new_position } => {
            let from = find_stop(stops, *destination_id)?;
            if *new_position >= stops.len() {
                return Err(PlannerError::validation(format!(
                    "position {} is outside the route (0..{})",
                    new_position,
                    stops.len()
                )));
            }
            let stop = stops.remove(from);
            stops.insert(*new_position, stop);
        }
        RouteModification::AddDestination { destination, position } => {
            if stops.iter().any(|s| s.destination.id == destination.id) {
                return Err(PlannerError::validation(format!(
                    "destination {} is already on this route",
                    destination.id
                )));
            }
            if !destination.coordinates.is_valid() {
                return Err(PlannerError::validation(format!(
                    "destination {} has invalid coordinates",
                    destination.id
                )));
            }
            let position = position.unwrap_or(stops.len());
            if position > stops.len() {
                return Err(PlannerError::validation(format!(
                    "position {} is outside the route (0..={})",
                    position,
                    stops.len()
                )));
            }
            stops.insert(
                position,
                WorkingStop {
                    destination: destination.clone(),
                    dwell_minutes: default_dwell,
                },
            );
        }
        RouteModification::RemoveDestination { destination_id } => {
            let index = find_stop(stops, *destination_id)?;
            stops.remove(index);
        }
        RouteModification::SetDwell { destination_id, dwell_minutes } => {
            if !dwell_minutes.is_finite() || *dwell_minutes < 0.0 {
                return Err(PlannerError::validation(format!(
                    "dwell must be >= 0 (got {})",
                    dwell_minutes
                )));
            }
            let index = find_stop(stops, *destination_id)?;
            stops[index].dwell_minutes = *dwell_minutes;
        }
    }
    Ok(())
}

/// Stop-by-stop diff of two versions, deltas as B minus A
pub fn compare_versions(a: &RouteVersion, b: &RouteVersion) -> VersionComparison {
    let ids_a: HashSet<Uuid> = a.stops.iter().map(|s| s.destination.id).collect();
    let ids_b: HashSet<Uuid> = b.stops.iter().map(|s| s.destination.id).collect();

    let added = b
        .stops
        .iter()
        .filter(|s| !ids_a.contains(&s.destination.id))
        .map(|s| StopPresence {
            destination_id: s.destination.id,
            address: s.destination.address.clone(),
            position: s.sequence,
        })
        .collect();
    let removed = a
        .stops
        .iter()
        .filter(|s| !ids_b.contains(&s.destination.id))
        .map(|s| StopPresence {
            destination_id: s.destination.id,
            address: s.destination.address.clone(),
            position: s.sequence,
        })
        .collect();

    // Relative order among destinations present in both
    let common_a: Vec<Uuid> = a
        .stops
        .iter()
        .map(|s| s.destination.id)
        .filter(|id| ids_b.contains(id))
        .collect();
    let position_b: HashMap<Uuid, usize> = b
        .stops
        .iter()
        .map(|s| s.destination.id)
        .filter(|id| ids_a.contains(id))
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();

    let reordered = common_a
        .iter()
        .enumerate()
        .filter_map(|(from, id)| {
            let to = *position_b.get(id)?;
            (from != to).then(|| ReorderedStop {
                destination_id: *id,
                from_position: from as u32,
                to_position: to as u32,
            })
        })
        .collect();

    let completion_delta_minutes = match (a.metrics.estimated_completion, b.metrics.estimated_completion) {
        (Some(ca), Some(cb)) => Some((cb - ca).num_minutes()),
        _ => None,
    };

    VersionComparison {
        version_a: a.id,
        version_b: b.id,
        added,
        removed,
        reordered,
        distance_delta_km: b.metrics.total_distance_km - a.metrics.total_distance_km,
        duration_delta_minutes: b.metrics.total_duration_minutes - a.metrics.total_duration_minutes,
        days_delta: i64::from(b.metrics.total_days) - i64::from(a.metrics.total_days),
        completion_delta_minutes,
    }
}

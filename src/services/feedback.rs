//! Feedback recording and estimator calibration

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::defaults::{CALIBRATION_MAX_DEVIATION, CALIBRATION_WINDOW, ROAD_COEFFICIENT_BOUNDS};
use crate::error::{PlannerError, PlannerResult};
use crate::services::store::{DeviationMetric, FeedbackStore, VersionStore};
use crate::types::{CalibrationSummary, RecordFeedbackRequest, RouteFeedback};

pub struct FeedbackAggregator {
    versions: Arc<dyn VersionStore>,
    store: Arc<dyn FeedbackStore>,
    base_road_coefficient: f64,
}

/// (actual - estimated) / estimated, or None when nothing was estimated
fn deviation(actual: Option<f64>, estimated: f64) -> Option<f64> {
    let actual = actual?;
    if estimated > 0.0 {
        Some((actual - estimated) / estimated)
    } else {
        None
    }
}

fn check_actual(name: &str, value: Option<f64>) -> PlannerResult<()> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => Err(PlannerError::validation(format!(
            "{} must be a non-negative number (got {})",
            name, v
        ))),
        _ => Ok(()),
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

impl FeedbackAggregator {
    pub fn new(versions: Arc<dyn VersionStore>, store: Arc<dyn FeedbackStore>, base_road_coefficient: f64) -> Self {
        Self {
            versions,
            store,
            base_road_coefficient,
        }
    }

    /// Append feedback for an executed version.
    pub async fn record_feedback(&self, request: RecordFeedbackRequest) -> PlannerResult<RouteFeedback> {
        let version_id = request.version_id;
        let version = self
            .versions
            .get_version(version_id)
            .await?
            .ok_or_else(|| PlannerError::version_not_found(version_id))?;

        if !version.status.accepts_feedback() {
            return Err(PlannerError::validation(format!(
                "feedback can only be recorded for active or superseded versions, this one is {}",
                version.status
            ))
            .for_version(version_id)
            .for_load(version.load_id));
        }
        if !(1..=5).contains(&request.rating) {
            return Err(PlannerError::validation(format!(
                "rating must be between 1 and 5 (got {})",
                request.rating
            ))
            .for_version(version_id));
        }
        check_actual("actualDurationMinutes", request.actual_duration_minutes)
            .and_then(|_| check_actual("actualDistanceKm", request.actual_distance_km))
            .map_err(|e| e.for_version(version_id))?;

        let issues: BTreeSet<String> = request
            .issues
            .into_iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect();

        let feedback = RouteFeedback {
            id: Uuid::new_v4(),
            version_id,
            rating: request.rating,
            comments: request.comments,
            actual_duration_minutes: request.actual_duration_minutes,
            actual_distance_km: request.actual_distance_km,
            issues: issues.into_iter().collect(),
            duration_deviation: deviation(
                request.actual_duration_minutes,
                version.metrics.total_duration_minutes,
            ),
            distance_deviation: deviation(request.actual_distance_km, version.metrics.total_distance_km),
            road_coefficient: version
                .distance_is_approximated()
                .then_some(version.road_coefficient),
            recorded_at: Utc::now(),
        };

        self.store.insert_feedback(&feedback).await?;
        info!(
            "Recorded feedback {} for version {} (rating {}, duration deviation {:?})",
            feedback.id, version_id, feedback.rating, feedback.duration_deviation
        );

        Ok(feedback)
    }

    pub async fn feedback_for_version(&self, version_id: Uuid) -> PlannerResult<Vec<RouteFeedback>> {
        Ok(self.store.list_feedback(version_id).await?)
    }

    /// Rolling, clamped deviation means and the suggested fallback road factor.
    ///
    /// The factor is the mean of `used × (1 + deviation)` over feedback on
    /// fully approximated versions, so a factor that already matches the
    /// roads stays put. Exact legs say nothing about the factor.
    pub async fn calibration(&self) -> PlannerResult<CalibrationSummary> {
        let durations = self
            .store
            .recent_deviations(DeviationMetric::Duration, CALIBRATION_WINDOW)
            .await?;
        let distances = self
            .store
            .recent_deviations(DeviationMetric::Distance, CALIBRATION_WINDOW)
            .await?;

        let mean_duration = mean(&durations).clamp(-CALIBRATION_MAX_DEVIATION, CALIBRATION_MAX_DEVIATION);
        let mean_distance = mean(&distances).clamp(-CALIBRATION_MAX_DEVIATION, CALIBRATION_MAX_DEVIATION);

        let samples = self.store.recent_coefficient_samples(CALIBRATION_WINDOW).await?;
        let implied: Vec<f64> = samples
            .iter()
            .map(|&(used, deviation)| {
                used * (1.0 + deviation.clamp(-CALIBRATION_MAX_DEVIATION, CALIBRATION_MAX_DEVIATION))
            })
            .collect();

        let (low, high) = ROAD_COEFFICIENT_BOUNDS;
        let suggested = if implied.is_empty() {
            self.base_road_coefficient
        } else {
            mean(&implied).clamp(low, high)
        };

        Ok(CalibrationSummary {
            duration_samples: durations.len(),
            mean_duration_deviation: mean_duration,
            distance_samples: distances.len(),
            mean_distance_deviation: mean_distance,
            coefficient_samples: implied.len(),
            suggested_road_coefficient: suggested,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::{InMemoryFeedbackStore, InMemoryVersionStore};
    use crate::types::{
        ApproximationReason, Coordinates, Destination, GenerationSource, Leg, NewRouteVersion,
        OptimizationConstraints, RouteMetrics, Stop, VersionStatus,
    };

    fn stop_with(leg: Leg) -> Stop {
        Stop {
            sequence: 0,
            destination: Destination {
                id: Uuid::from_u128(7),
                coordinates: Coordinates::new(43.65, -79.38),
                address: "Toronto".to_string(),
                expected_delivery_date: None,
            },
            incoming_leg: leg,
            dwell_minutes: 0.0,
            cumulative_distance_km: leg.distance_km(),
            cumulative_duration_minutes: leg.duration_minutes(),
            day_index: 0,
            estimated_arrival: chrono::NaiveDate::from_ymd_opt(2025, 3, 3)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        }
    }

    fn approximate(distance_km: f64, duration_minutes: f64) -> Leg {
        Leg::Approximate {
            distance_km,
            duration_minutes,
            reason: ApproximationReason::ProviderDisabled,
        }
    }

    async fn insert(
        versions: &InMemoryVersionStore,
        status: VersionStatus,
        leg: Leg,
        road_coefficient: f64,
    ) -> Uuid {
        let load_id = Uuid::from_u128(1);
        let version = versions
            .insert_version(NewRouteVersion {
                id: Uuid::new_v4(),
                load_id,
                stops: vec![stop_with(leg)],
                metrics: RouteMetrics {
                    total_distance_km: leg.distance_km(),
                    total_duration_minutes: leg.duration_minutes(),
                    total_days: 1,
                    estimated_completion: None,
                },
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
                road_coefficient,
                created_at: Utc::now(),
                created_by: "test".to_string(),
            })
            .await
            .unwrap();

        match status {
            VersionStatus::Active => {
                let current = versions.active_version_id(load_id).await.unwrap();
                versions.activate(load_id, version.id, current, Utc::now()).await.unwrap();
            }
            VersionStatus::Draft => {}
            other => {
                versions.transition(version.id, VersionStatus::Draft, other).await.unwrap();
            }
        }
        version.id
    }

    async fn setup(status: VersionStatus, duration: f64, distance: f64) -> (FeedbackAggregator, Uuid) {
        let versions = Arc::new(InMemoryVersionStore::new());
        let version_id = insert(&versions, status, approximate(distance, duration), 1.3).await;
        let aggregator = FeedbackAggregator::new(versions, Arc::new(InMemoryFeedbackStore::new()), 1.3);
        (aggregator, version_id)
    }

    fn request(version_id: Uuid, rating: u8) -> RecordFeedbackRequest {
        RecordFeedbackRequest {
            version_id,
            rating,
            comments: String::new(),
            actual_duration_minutes: None,
            actual_distance_km: None,
            issues: vec![],
        }
    }

    #[tokio::test]
    async fn test_duration_deviation_shows_in_calibration() {
        let (aggregator, version_id) = setup(VersionStatus::Active, 600.0, 500.0).await;

        let feedback = aggregator
            .record_feedback(RecordFeedbackRequest {
                actual_duration_minutes: Some(700.0),
                ..request(version_id, 4)
            })
            .await
            .unwrap();

        let deviation = feedback.duration_deviation.unwrap();
        assert!((deviation - 0.1667).abs() < 1e-4, "got {}", deviation);
        assert!(feedback.distance_deviation.is_none());

        let summary = aggregator.calibration().await.unwrap();
        assert_eq!(summary.duration_samples, 1);
        assert!((summary.mean_duration_deviation - 0.1667).abs() < 1e-4);
        assert_eq!(summary.distance_samples, 0);
        assert_eq!(summary.suggested_road_coefficient, 1.3);
    }

    #[tokio::test]
    async fn test_draft_versions_reject_feedback() {
        let (aggregator, version_id) = setup(VersionStatus::Draft, 600.0, 500.0).await;
        let result = aggregator.record_feedback(request(version_id, 4)).await;
        assert!(matches!(result, Err(PlannerError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_discarded_versions_reject_feedback() {
        let (aggregator, version_id) = setup(VersionStatus::Discarded, 600.0, 500.0).await;
        let result = aggregator.record_feedback(request(version_id, 4)).await;
        assert!(matches!(result, Err(PlannerError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_superseded_versions_accept_feedback() {
        let (aggregator, version_id) = setup(VersionStatus::Superseded, 600.0, 500.0).await;
        assert!(aggregator.record_feedback(request(version_id, 2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rating_out_of_range_rejected() {
        let (aggregator, version_id) = setup(VersionStatus::Active, 600.0, 500.0).await;
        for rating in [0, 6] {
            let result = aggregator.record_feedback(request(version_id, rating)).await;
            assert!(matches!(result, Err(PlannerError::Validation { .. })));
        }
    }

    #[tokio::test]
    async fn test_negative_actuals_rejected() {
        let (aggregator, version_id) = setup(VersionStatus::Active, 600.0, 500.0).await;
        let result = aggregator
            .record_feedback(RecordFeedbackRequest {
                actual_distance_km: Some(-1.0),
                ..request(version_id, 3)
            })
            .await;
        assert!(matches!(result, Err(PlannerError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_unknown_version_not_found() {
        let (aggregator, _) = setup(VersionStatus::Active, 600.0, 500.0).await;
        let result = aggregator.record_feedback(request(Uuid::new_v4(), 3)).await;
        assert!(matches!(result, Err(PlannerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_zero_estimate_has_no_deviation() {
        let (aggregator, version_id) = setup(VersionStatus::Active, 0.0, 0.0).await;
        let feedback = aggregator
            .record_feedback(RecordFeedbackRequest {
                actual_duration_minutes: Some(30.0),
                actual_distance_km: Some(10.0),
                ..request(version_id, 5)
            })
            .await
            .unwrap();
        assert!(feedback.duration_deviation.is_none());
        assert!(feedback.distance_deviation.is_none());
    }

    #[tokio::test]
    async fn test_issues_are_deduplicated_and_sorted() {
        let (aggregator, version_id) = setup(VersionStatus::Active, 600.0, 500.0).await;
        let feedback = aggregator
            .record_feedback(RecordFeedbackRequest {
                issues: vec!["traffic".into(), " closure ".into(), "traffic".into(), "".into()],
                ..request(version_id, 3)
            })
            .await
            .unwrap();
        assert_eq!(feedback.issues, vec!["closure".to_string(), "traffic".to_string()]);
    }

    #[tokio::test]
    async fn test_calibration_is_clamped() {
        let (aggregator, version_id) = setup(VersionStatus::Active, 100.0, 100.0).await;
        aggregator
            .record_feedback(RecordFeedbackRequest {
                actual_distance_km: Some(400.0),
                ..request(version_id, 1)
            })
            .await
            .unwrap();

        let summary = aggregator.calibration().await.unwrap();
        assert_eq!(summary.mean_distance_deviation, 0.5);
        // 1.3 * 1.5 = 1.95, inside the bounds
        assert!((summary.suggested_road_coefficient - 1.95).abs() < 1e-9);
    }

    async fn distance_feedback(aggregator: &FeedbackAggregator, version_id: Uuid, actual_km: f64) {
        aggregator
            .record_feedback(RecordFeedbackRequest {
                actual_distance_km: Some(actual_km),
                ..request(version_id, 4)
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_calibration_settles_on_true_road_factor() {
        // Roads are 1.43x the straight line; 100 km straight-line route
        let versions = Arc::new(InMemoryVersionStore::new());
        let aggregator = FeedbackAggregator::new(versions.clone(), Arc::new(InMemoryFeedbackStore::new()), 1.3);

        let first = insert(&versions, VersionStatus::Active, approximate(130.0, 100.0), 1.3).await;
        distance_feedback(&aggregator, first, 143.0).await;
        let suggested = aggregator.calibration().await.unwrap().suggested_road_coefficient;
        assert!((suggested - 1.43).abs() < 1e-9, "got {}", suggested);

        // Built with the calibrated factor, the estimate is now right
        let second = insert(&versions, VersionStatus::Active, approximate(143.0, 100.0), suggested).await;
        distance_feedback(&aggregator, second, 143.0).await;
        let summary = aggregator.calibration().await.unwrap();
        assert_eq!(summary.coefficient_samples, 2);
        assert!((summary.suggested_road_coefficient - 1.43).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_exact_legs_do_not_move_road_factor() {
        let versions = Arc::new(InMemoryVersionStore::new());
        let aggregator = FeedbackAggregator::new(versions.clone(), Arc::new(InMemoryFeedbackStore::new()), 1.3);
        let exact = Leg::Exact {
            distance_km: 100.0,
            duration_minutes: 80.0,
        };
        let version_id = insert(&versions, VersionStatus::Active, exact, 1.3).await;

        distance_feedback(&aggregator, version_id, 150.0).await;

        let summary = aggregator.calibration().await.unwrap();
        assert_eq!(summary.distance_samples, 1);
        assert!((summary.mean_distance_deviation - 0.5).abs() < 1e-9);
        assert_eq!(summary.coefficient_samples, 0);
        assert_eq!(summary.suggested_road_coefficient, 1.3);
    }
}

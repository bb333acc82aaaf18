//! Post-delivery feedback types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable feedback record for an executed route version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteFeedback {
    pub id: Uuid,
    pub version_id: Uuid,
    pub rating: u8,
    pub comments: String,
    pub actual_duration_minutes: Option<f64>,
    pub actual_distance_km: Option<f64>,
    pub issues: Vec<String>,
    /// (actual - estimated) / estimated
    pub duration_deviation: Option<f64>,
    /// (actual - estimated) / estimated
    pub distance_deviation: Option<f64>,
    /// Road factor the version's distance came from; only set when every leg
    /// of the version was approximated
    #[serde(default)]
    pub road_coefficient: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

/// Request to record feedback against a version
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordFeedbackRequest {
    pub version_id: Uuid,
    pub rating: u8,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub actual_duration_minutes: Option<f64>,
    #[serde(default)]
    pub actual_distance_km: Option<f64>,
    #[serde(default)]
    pub issues: Vec<String>,
}

/// Aggregated, bounded calibration signal derived from recent feedback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationSummary {
    pub duration_samples: usize,
    pub mean_duration_deviation: f64,
    pub distance_samples: usize,
    pub mean_distance_deviation: f64,
    /// Feedback on fully approximated versions that fed the road factor
    pub coefficient_samples: usize,
    /// Road distance correction factor the fallback estimator should use
    pub suggested_road_coefficient: f64,
}

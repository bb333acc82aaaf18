//! Request and result types for route planning operations

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Coordinates, Destination, Load, OptimizationConstraints};

/// Request to generate a new route version for a load
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRouteRequest {
    pub load_id: Uuid,
    #[serde(default)]
    pub constraints: OptimizationConstraints,
    /// Departure from the origin; defaults to the next configured day start
    #[serde(default)]
    pub departure: Option<NaiveDateTime>,
    pub created_by: String,
}

/// Input file of the offline `plan` command: a load plus generation options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanInput {
    pub load: Load,
    #[serde(default)]
    pub constraints: OptimizationConstraints,
    #[serde(default)]
    pub departure: Option<NaiveDateTime>,
    #[serde(default = "default_plan_author")]
    pub created_by: String,
}

fn default_plan_author() -> String {
    "cli".to_string()
}

impl PlanInput {
    pub fn generate_request(&self) -> GenerateRouteRequest {
        GenerateRouteRequest {
            load_id: self.load.id,
            constraints: self.constraints.clone(),
            departure: self.departure,
            created_by: self.created_by.clone(),
        }
    }
}

/// A single manual edit applied by `modify`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteModification {
    /// Full new order, as a permutation of the current destination ids
    #[serde(rename_all = "camelCase")]
    Reorder { destination_ids: Vec<Uuid> },
    #[serde(rename_all = "camelCase")]
    MoveStop { destination_id: Uuid, new_position: usize },
    /// Insert at `position`, or append when absent
    #[serde(rename_all = "camelCase")]
    AddDestination {
        destination: Destination,
        #[serde(default)]
        position: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveDestination { destination_id: Uuid },
    #[serde(rename_all = "camelCase")]
    SetDwell { destination_id: Uuid, dwell_minutes: f64 },
}

/// Request to derive a new version from an existing one
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyRouteRequest {
    pub version_id: Uuid,
    pub modifications: Vec<RouteModification>,
    pub reason: String,
    /// Re-run the sequencer over the modified destination set
    #[serde(default)]
    pub resequence: bool,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionIdRequest {
    pub version_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadIdRequest {
    pub load_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateRequest {
    pub version_id: Uuid,
    /// Optimistic concurrency token: the active version the caller last saw
    #[serde(default, deserialize_with = "present_or_null")]
    pub expected_active_version_id: Option<Option<Uuid>>,
}

/// Keeps an explicit `null` distinct from an absent field.
fn present_or_null<'de, D>(deserializer: D) -> Result<Option<Option<Uuid>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Uuid>::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    pub version_a: Uuid,
    pub version_b: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionsRequest {
    pub coordinates: Coordinates,
}

/// Result of a successful activation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationResult {
    pub load_id: Uuid,
    pub activated_version_id: Uuid,
    pub superseded_version_id: Option<Uuid>,
}

/// A destination present in only one of the compared versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPresence {
    pub destination_id: Uuid,
    pub address: String,
    pub position: u32,
}

/// A destination whose relative position differs between versions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderedStop {
    pub destination_id: Uuid,
    pub from_position: u32,
    pub to_position: u32,
}

/// Stop-by-stop diff and aggregate deltas (B minus A)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub version_a: Uuid,
    pub version_b: Uuid,
    pub added: Vec<StopPresence>,
    pub removed: Vec<StopPresence>,
    pub reordered: Vec<ReorderedStop>,
    pub distance_delta_km: f64,
    pub duration_delta_minutes: f64,
    pub days_delta: i64,
    /// Difference in estimated completion; absent when either route is empty
    pub completion_delta_minutes: Option<i64>,
}

impl VersionComparison {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reordered.is_empty()
    }
}

//! Planner error taxonomy
//!
//! Structural and contractual failures are surfaced to callers as
//! [`PlannerError`]. Recoverable conditions (provider failures, timeouts) never
//! appear here: they are absorbed into approximate legs and reported as
//! warnings on the resulting version.

use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::types::VersionStatus;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        load_id: Option<Uuid>,
        version_id: Option<Uuid>,
        leg_index: Option<usize>,
    },

    #[error("conflict on load {load_id}: {message}")]
    Conflict {
        message: String,
        load_id: Uuid,
        version_id: Option<Uuid>,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("cannot {action} version {version_id} while it is {from}")]
    InvalidTransition {
        version_id: Uuid,
        from: VersionStatus,
        action: &'static str,
    },

    #[error("route generation for load {load_id} was cancelled")]
    Cancelled { load_id: Uuid },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type PlannerResult<T> = std::result::Result<T, PlannerError>;

impl PlannerError {
    pub fn validation(message: impl Into<String>) -> Self {
        PlannerError::Validation {
            message: message.into(),
            load_id: None,
            version_id: None,
            leg_index: None,
        }
    }

    pub fn conflict(load_id: Uuid, version_id: Option<Uuid>, message: impl Into<String>) -> Self {
        PlannerError::Conflict {
            message: message.into(),
            load_id,
            version_id,
        }
    }

    pub fn load_not_found(id: Uuid) -> Self {
        PlannerError::NotFound { entity: "load", id }
    }

    pub fn version_not_found(id: Uuid) -> Self {
        PlannerError::NotFound { entity: "route version", id }
    }

    /// Attach the load id to a validation error that does not carry one yet.
    pub fn for_load(mut self, id: Uuid) -> Self {
        if let PlannerError::Validation { load_id, .. } = &mut self {
            load_id.get_or_insert(id);
        }
        self
    }

    /// Attach the version id to a validation error that does not carry one yet.
    pub fn for_version(mut self, id: Uuid) -> Self {
        if let PlannerError::Validation { version_id, .. } = &mut self {
            version_id.get_or_insert(id);
        }
        self
    }

    pub fn at_leg(mut self, index: usize) -> Self {
        if let PlannerError::Validation { leg_index, .. } = &mut self {
            leg_index.get_or_insert(index);
        }
        self
    }

    /// Stable wire code used in error responses.
    pub const fn code(&self) -> &'static str {
        match self {
            PlannerError::Validation { .. } => "VALIDATION_ERROR",
            PlannerError::Conflict { .. } => "CONFLICT",
            PlannerError::NotFound { .. } => "NOT_FOUND",
            PlannerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            PlannerError::Cancelled { .. } => "CANCELLED",
            PlannerError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Context for the caller to act on, if any.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            PlannerError::Validation { load_id, version_id, leg_index, .. } => {
                if load_id.is_none() && version_id.is_none() && leg_index.is_none() {
                    None
                } else {
                    Some(json!({
                        "loadId": load_id,
                        "versionId": version_id,
                        "legIndex": leg_index,
                    }))
                }
            }
            PlannerError::Conflict { load_id, version_id, .. } => Some(json!({
                "loadId": load_id,
                "versionId": version_id,
            })),
            PlannerError::NotFound { entity, id } => Some(json!({ "entity": entity, "id": id })),
            PlannerError::InvalidTransition { version_id, from, .. } => Some(json!({
                "versionId": version_id,
                "status": from.as_str(),
            })),
            PlannerError::Cancelled { load_id } => Some(json!({ "loadId": load_id })),
            PlannerError::Storage(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_context_is_attached_once() {
        let load = Uuid::from_u128(1);
        let other = Uuid::from_u128(2);
        let err = PlannerError::validation("bad").for_load(load).for_load(other).at_leg(3);

        match err {
            PlannerError::Validation { load_id, leg_index, .. } => {
                assert_eq!(load_id, Some(load));
                assert_eq!(leg_index, Some(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(PlannerError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(PlannerError::load_not_found(Uuid::nil()).code(), "NOT_FOUND");
        assert_eq!(
            PlannerError::conflict(Uuid::nil(), None, "race").code(),
            "CONFLICT"
        );
        assert_eq!(
            PlannerError::Storage(anyhow::anyhow!("db down")).code(),
            "STORAGE_ERROR"
        );
    }

    #[test]
    fn test_details_for_plain_validation_is_none() {
        assert!(PlannerError::validation("x").details().is_none());
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = PlannerError::InvalidTransition {
            version_id: Uuid::nil(),
            from: VersionStatus::Active,
            action: "discard",
        };
        assert!(err.to_string().contains("discard"));
        assert!(err.to_string().contains("active"));
    }
}

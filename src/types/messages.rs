//! NATS message types

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::error::PlannerError;

/// Generic request wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> Request<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Generic success response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessResponse<T> {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> SuccessResponse<T> {
    pub fn new(request_id: Uuid, payload: T) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(request_id: Uuid, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn from_planner_error(request_id: Uuid, err: &PlannerError) -> Self {
        Self {
            id: request_id,
            timestamp: Utc::now(),
            error: ErrorDetail {
                code: err.code().to_string(),
                message: err.to_string(),
                details: err.details(),
            },
        }
    }
}

/// Payload for subjects that take no arguments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_carries_planner_context() {
        let load_id = Uuid::from_u128(7);
        let err = PlannerError::conflict(load_id, None, "active version changed");
        let response = ErrorResponse::from_planner_error(Uuid::nil(), &err);

        assert_eq!(response.error.code, "CONFLICT");
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"loadId\""));
        assert!(json.contains(&load_id.to_string()));
    }

    #[test]
    fn test_error_response_omits_empty_details() {
        let response = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", "bad json");
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_request_parses_camel_case() {
        let json = r#"{"id":"00000000-0000-0000-0000-000000000000","timestamp":"2026-01-15T08:00:00Z","payload":{}}"#;
        let req: Request<EmptyPayload> = serde_json::from_str(json).unwrap();
        assert_eq!(req.id, Uuid::nil());
    }
}

//! Route planning message handlers

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{PlannerError, PlannerResult};
use crate::services::versions::RouteVersionManager;
use crate::types::{
    ActivateRequest, ActivationResult, CompareRequest, ConditionsRequest, EmptyPayload, ErrorResponse,
    GenerateRouteRequest, LoadIdRequest, ModifyRouteRequest, RecordFeedbackRequest, Request,
    SuccessResponse, VersionIdRequest,
};

/// Serve one subject: parse `Request<P>`, run `handle` in its own task and
/// reply with the result.
///
/// Every in-flight request gets a child of `shutdown`, so stopping the worker
/// cancels generations that have not persisted yet.
pub async fn serve<P, R, F, Fut>(
    client: Client,
    mut subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
    handle: F,
) -> Result<()>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Arc<RouteVersionManager>, P, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PlannerResult<R>> + Send + 'static,
{
    let handle = Arc::new(handle);

    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = subscriber.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        debug!("Received {} message", msg.subject);

        let reply = match msg.reply {
            Some(ref reply) => reply.clone(),
            None => {
                warn!("Message on {} without reply subject", msg.subject);
                continue;
            }
        };

        let request: Request<P> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to parse {} request: {}", msg.subject, e);
                let error = ErrorResponse::new(Uuid::nil(), "INVALID_REQUEST", e.to_string());
                let _ = client.publish(reply, serde_json::to_vec(&error)?.into()).await;
                continue;
            }
        };

        let client = client.clone();
        let manager = Arc::clone(&manager);
        let handle = Arc::clone(&handle);
        let cancel = shutdown.child_token();
        let subject = msg.subject.to_string();

        tokio::spawn(async move {
            let outcome = (*handle)(manager, request.payload, cancel).await;
            let bytes = match outcome {
                Ok(payload) => serde_json::to_vec(&SuccessResponse::new(request.id, payload)),
                Err(e) => {
                    log_failure(&subject, &e);
                    serde_json::to_vec(&ErrorResponse::from_planner_error(request.id, &e))
                }
            };
            match bytes {
                Ok(bytes) => {
                    if let Err(e) = client.publish(reply, bytes.into()).await {
                        error!("Failed to publish {} reply: {}", subject, e);
                    }
                }
                Err(e) => error!("Failed to serialize {} reply: {}", subject, e),
            }
        });
    }

    Ok(())
}

fn log_failure(subject: &str, err: &PlannerError) {
    match err {
        PlannerError::Storage(e) => error!("{} failed: {:#}", subject, e),
        PlannerError::Conflict { .. } | PlannerError::InvalidTransition { .. } => {
            warn!("{} rejected: {}", subject, err)
        }
        _ => debug!("{} rejected: {}", subject, err),
    }
}

pub async fn handle_generate(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: GenerateRouteRequest, cancel| async move {
        manager.generate(payload, &cancel).await
    })
    .await
}

pub async fn handle_list_versions(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: LoadIdRequest, _| async move {
        manager.list_versions(payload.load_id).await
    })
    .await
}

pub async fn handle_get_version(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: VersionIdRequest, _| async move {
        manager.get_version(payload.version_id).await
    })
    .await
}

/// Replies with `null` when the load has no active version.
pub async fn handle_get_active(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: LoadIdRequest, _| async move {
        manager.get_active(payload.load_id).await
    })
    .await
}

pub async fn handle_modify(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: ModifyRouteRequest, cancel| async move {
        manager.modify(payload, &cancel).await
    })
    .await
}

pub async fn handle_activate(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: ActivateRequest, _| async move {
        activate(&manager, payload).await
    })
    .await
}

/// An explicit `expectedActiveVersionId` (including `null`) turns activation
/// into a compare-and-swap against that value.
async fn activate(manager: &RouteVersionManager, request: ActivateRequest) -> PlannerResult<ActivationResult> {
    match request.expected_active_version_id {
        Some(expected) => manager.activate_if(request.version_id, expected).await,
        None => manager.activate(request.version_id).await,
    }
}

pub async fn handle_discard(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: VersionIdRequest, _| async move {
        manager.discard(payload.version_id).await
    })
    .await
}

pub async fn handle_compare(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: CompareRequest, _| async move {
        manager.compare(payload.version_a, payload.version_b).await
    })
    .await
}

pub async fn handle_feedback_record(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: RecordFeedbackRequest, _| async move {
        manager.feedback().record_feedback(payload).await
    })
    .await
}

pub async fn handle_feedback_list(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: VersionIdRequest, _| async move {
        manager.get_version(payload.version_id).await?;
        manager.feedback().feedback_for_version(payload.version_id).await
    })
    .await
}

pub async fn handle_calibration(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, _: EmptyPayload, _| async move {
        manager.feedback().calibration().await
    })
    .await
}

pub async fn handle_conditions(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |manager, payload: ConditionsRequest, _| async move {
        manager.conditions_at(payload.coordinates).await
    })
    .await
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PongResponse {
    pub message: String,
    pub timestamp: String,
}

pub async fn handle_ping(
    client: Client,
    subscriber: Subscriber,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    serve(client, subscriber, manager, shutdown, |_, _: EmptyPayload, _| async move {
        Ok(PongResponse {
            message: "Pong".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlannerSettings;
    use crate::services::feedback::FeedbackAggregator;
    use crate::services::store::{InMemoryFeedbackStore, InMemoryLoadRegistry, InMemoryVersionStore};
    use crate::types::{Coordinates, Destination, Load, OptimizationConstraints, RouteVersion};

    fn manager_with_load(load_id: Uuid) -> RouteVersionManager {
        let loads = Arc::new(InMemoryLoadRegistry::new());
        loads.insert(Load {
            id: load_id,
            origin: Coordinates::new(44.56, -80.94),
            destinations: vec![Destination {
                id: Uuid::from_u128(11),
                coordinates: Coordinates::new(43.65, -79.38),
                address: "Toronto".to_string(),
                expected_delivery_date: None,
            }],
            active_version_id: None,
        });
        let versions = Arc::new(InMemoryVersionStore::new());
        let feedback = Arc::new(FeedbackAggregator::new(
            versions.clone(),
            Arc::new(InMemoryFeedbackStore::new()),
            1.3,
        ));
        RouteVersionManager::new(loads, versions, feedback, None, None, PlannerSettings::default())
    }

    async fn draft(manager: &RouteVersionManager, load_id: Uuid) -> RouteVersion {
        manager
            .generate(
                GenerateRouteRequest {
                    load_id,
                    constraints: OptimizationConstraints::default(),
                    departure: None,
                    created_by: "test".to_string(),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_activate_without_token_supersedes() {
        let load_id = Uuid::from_u128(1);
        let manager = manager_with_load(load_id);
        let v1 = draft(&manager, load_id).await;
        let v2 = draft(&manager, load_id).await;

        let request = |version_id| ActivateRequest {
            version_id,
            expected_active_version_id: None,
        };
        activate(&manager, request(v1.id)).await.unwrap();
        let result = activate(&manager, request(v2.id)).await.unwrap();
        assert_eq!(result.superseded_version_id, Some(v1.id));
    }

    #[tokio::test]
    async fn test_activate_with_stale_token_conflicts() {
        let load_id = Uuid::from_u128(1);
        let manager = manager_with_load(load_id);
        let v1 = draft(&manager, load_id).await;
        let v2 = draft(&manager, load_id).await;
        manager.activate(v1.id).await.unwrap();

        let result = activate(
            &manager,
            ActivateRequest {
                version_id: v2.id,
                expected_active_version_id: Some(None),
            },
        )
        .await;
        assert!(matches!(result, Err(PlannerError::Conflict { .. })));
    }
}

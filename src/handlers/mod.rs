//! NATS message handlers

pub mod route;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_nats::{Client, Subscriber};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::services::versions::RouteVersionManager;

pub const SUBJECT_PREFIX: &str = "haulplan";

async fn spawn_handler<F, Fut>(
    client: &Client,
    subject: &'static str,
    manager: &Arc<RouteVersionManager>,
    shutdown: &CancellationToken,
    handler: F,
) -> Result<(&'static str, JoinHandle<Result<()>>)>
where
    F: FnOnce(Client, Subscriber, Arc<RouteVersionManager>, CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let subscriber = client.subscribe(format!("{}.{}", SUBJECT_PREFIX, subject)).await?;
    let handle = tokio::spawn(handler(
        client.clone(),
        subscriber,
        Arc::clone(manager),
        shutdown.clone(),
    ));
    Ok((subject, handle))
}

/// Start all message handlers and wait until one stops or shutdown is requested
pub async fn start_handlers(
    client: Client,
    manager: Arc<RouteVersionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting message handlers...");

    let handles = vec![
        spawn_handler(&client, "ping", &manager, &shutdown, route::handle_ping).await?,
        spawn_handler(&client, "route.generate", &manager, &shutdown, route::handle_generate).await?,
        spawn_handler(&client, "route.versions.list", &manager, &shutdown, route::handle_list_versions).await?,
        spawn_handler(&client, "route.version.get", &manager, &shutdown, route::handle_get_version).await?,
        spawn_handler(&client, "route.active.get", &manager, &shutdown, route::handle_get_active).await?,
        spawn_handler(&client, "route.modify", &manager, &shutdown, route::handle_modify).await?,
        spawn_handler(&client, "route.activate", &manager, &shutdown, route::handle_activate).await?,
        spawn_handler(&client, "route.discard", &manager, &shutdown, route::handle_discard).await?,
        spawn_handler(&client, "route.compare", &manager, &shutdown, route::handle_compare).await?,
        spawn_handler(&client, "route.feedback.record", &manager, &shutdown, route::handle_feedback_record).await?,
        spawn_handler(&client, "route.feedback.list", &manager, &shutdown, route::handle_feedback_list).await?,
        spawn_handler(&client, "route.feedback.calibration", &manager, &shutdown, route::handle_calibration).await?,
        spawn_handler(&client, "conditions.get", &manager, &shutdown, route::handle_conditions).await?,
    ];

    info!("Subscribed to {} NATS subjects under '{}.'", handles.len(), SUBJECT_PREFIX);

    let (subjects, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();

    select! {
        (result, index, _) = futures::future::select_all(handles) => {
            error!("Handler for {} finished: {:?}", subjects[index], result);
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown requested, stopping handlers");
        }
    }

    Ok(())
}

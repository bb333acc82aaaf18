//! Haulplan Worker - route planning and versioning for transport loads
//!
//! This worker connects to NATS and answers planning requests from dispatch.

mod cli;
mod config;
mod defaults;
mod db;
mod error;
mod handlers;
mod services;
mod types;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::services::conditions::create_conditions_provider;
use crate::services::feedback::FeedbackAggregator;
use crate::services::routing::create_routing_provider;
use crate::services::store::{InMemoryFeedbackStore, InMemoryLoadRegistry, InMemoryVersionStore};
use crate::services::versions::RouteVersionManager;
use crate::types::PlanInput;

#[tokio::main]
async fn main() -> Result<()> {
    // Logs directory - use LOGS_DIR env var or default to ./logs
    let logs_dir = std::env::var("LOGS_DIR")
        .unwrap_or_else(|_| "logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        &logs_dir,
        "worker.log",
    );
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,haulplan_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))  // console
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))  // file
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            let pool = db::create_pool(config.database_url()?).await?;
            db::run_migrations(&pool).await
        }
        Command::Plan { input } => plan(config, &input).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Haulplan Worker...");

    // Connect to database
    let pool = db::create_pool(config.database_url()?).await?;
    info!("Connected to PostgreSQL");

    db::run_migrations(&pool).await?;

    let store = Arc::new(db::PgStore::new(pool));

    let routing = create_routing_provider(config.valhalla_url.clone()).await?;
    let conditions = create_conditions_provider(config.weather_url.clone(), routing.clone())?;

    let feedback = Arc::new(FeedbackAggregator::new(
        store.clone(),
        store.clone(),
        config.planner.road_coefficient,
    ));
    let manager = Arc::new(RouteVersionManager::new(
        store.clone(),
        store,
        feedback,
        routing,
        conditions,
        config.planner.clone(),
    ));

    // Connect to NATS (supports optional NATS_USER/NATS_PASSWORD auth).
    let nats_client = match (std::env::var("NATS_USER"), std::env::var("NATS_PASSWORD")) {
        (Ok(user), Ok(password)) if !user.is_empty() => {
            async_nats::ConnectOptions::new()
                .user_and_password(user, password)
                .connect(&config.nats_url)
                .await?
        }
        _ => async_nats::connect(&config.nats_url).await?,
    };
    info!("Connected to NATS at {}", config.nats_url);

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            ctrl_c_token.cancel();
        }
    });

    // Start message handlers
    let handler_result = handlers::start_handlers(nats_client, manager, shutdown).await;

    if let Err(e) = handler_result {
        error!("Handler error: {}", e);
        return Err(e);
    }

    Ok(())
}

/// One-shot generation against in-memory stores.
async fn plan(config: Config, input_path: &std::path::Path) -> Result<()> {
    let raw = std::fs::read_to_string(input_path)
        .with_context(|| format!("Failed to read {}", input_path.display()))?;
    let input: PlanInput = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid plan input in {}", input_path.display()))?;

    let loads = Arc::new(InMemoryLoadRegistry::new());
    loads.insert(input.load.clone());
    let versions = Arc::new(InMemoryVersionStore::new());
    let feedback = Arc::new(FeedbackAggregator::new(
        versions.clone(),
        Arc::new(InMemoryFeedbackStore::new()),
        config.planner.road_coefficient,
    ));

    let routing = create_routing_provider(config.valhalla_url.clone()).await?;
    let conditions = create_conditions_provider(config.weather_url.clone(), routing.clone())?;
    let manager = RouteVersionManager::new(loads, versions, feedback, routing, conditions, config.planner);

    let version = manager
        .generate(input.generate_request(), &CancellationToken::new())
        .await
        .context("Route generation failed")?;

    println!("{}", serde_json::to_string_pretty(&version)?);
    Ok(())
}

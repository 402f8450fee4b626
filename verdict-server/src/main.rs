use anyhow::{Context, Result};
use axum::{http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use verdict_server::clock::{Clock, SystemClock};
use verdict_server::config::Config;
use verdict_server::notify::LogNotifier;
use verdict_server::reconciliation::{reconcile_on_startup, sweep_loop};
use verdict_server::state_machine::RecordStore;
use verdict_server::status::status_handler;
use verdict_server::worker::{job_worker_loop, JobWorker};
use verdict_server::{AppState, AutoPublishScheduler, FeedbackService, SqliteRepository};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "verdict",
        "version": verdict_core::get_version(),
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting feedback moderation engine");

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let db_path = config.db_path();
    info!("Using state database: {}", db_path.display());
    let repo = Arc::new(
        SqliteRepository::new(&db_path).context("Failed to initialize SQLite database")?,
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let scheduler = Arc::new(AutoPublishScheduler::new(
        RecordStore::new(repo.clone()),
        clock.clone(),
    ));
    let service = FeedbackService::new(repo.clone(), repo.clone(), clock, config.policy())
        .with_default_review_limit(config.default_review_limit);

    // Fire every deadline missed while the server was down before anything
    // else touches the records.
    reconcile_on_startup(&scheduler).await;

    let worker = Arc::new(JobWorker::new(
        scheduler.as_ref().clone(),
        Arc::new(LogNotifier),
        config.worker(),
    ));
    let poll_interval = Duration::from_secs(config.worker_poll_interval_secs);
    tokio::spawn(async move {
        job_worker_loop(worker, poll_interval).await;
    });

    let sweep_interval = Duration::from_secs(config.sweep_interval_secs);
    tokio::spawn(async move {
        sweep_loop(scheduler, sweep_interval).await;
    });

    let app_state = Arc::new(AppState {
        service,
        status_auth_token: config.status_auth_token.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}

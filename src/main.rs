//! CloudGather - Main Entry Point

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use cloudgather::api::{self, AppState};
use cloudgather::config::Config;
use cloudgather::error::{AppError, Result};
use cloudgather::services::cache_store::CacheStore;
use cloudgather::services::log_ring::LogRing;
use cloudgather::services::scheduler::Scheduler;
use cloudgather::services::settings_store::SettingsStore;
use cloudgather::services::task_store::TaskStore;
use cloudgather::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    // Initialize tracing (guard must live until shutdown so the file log flushes)
    let _log_guard = telemetry::init_tracing(&config);
    telemetry::cleanup_old_logs(&config.log_dir, config.log_save_days);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting CloudGather"
    );

    tokio::fs::create_dir_all(&config.config_dir).await?;

    // Load persistent state
    let tasks = Arc::new(TaskStore::load(config.tasks_path()).await?);
    let settings = Arc::new(SettingsStore::load(config.settings_path()).await?);
    let cache = Arc::new(CacheStore::new(config.cache_dir()));
    let ring = Arc::new(LogRing::new());

    // Start the scheduler loop
    let scheduler = Scheduler::new(
        tasks.clone(),
        settings.clone(),
        cache.clone(),
        ring.clone(),
        config.max_concurrent_runs,
        config.stability_delay_secs,
    );
    let scheduler_loop = tokio::spawn(Arc::clone(&scheduler).run());

    // Build router
    let state = Arc::new(AppState {
        config: config.clone(),
        tasks,
        settings,
        cache,
        ring,
        scheduler: scheduler.clone(),
    });
    let app = Router::new()
        .merge(api::routes::create_router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e| AppError::Config(format!("bad bind address: {e}")))?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler.clone()))
        .await?;

    let _ = scheduler_loop.await;
    tracing::info!("CloudGather stopped");
    Ok(())
}

/// Wait for Ctrl-C, then propagate cancellation to the scheduler and every
/// in-flight worker.
async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
    scheduler.shutdown();
}

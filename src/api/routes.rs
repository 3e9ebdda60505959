//! Route definitions for the API.

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::SharedState;

/// Create the main API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        // Health and status (no side effects)
        .route("/api/health", get(handlers::status::health))
        .route("/api/status", get(handlers::status::status))
        .route("/api/queue", get(handlers::status::queue))
        .route("/api/browse", get(handlers::status::browse))
        .route(
            "/api/logs",
            get(handlers::status::general_logs).delete(handlers::status::clear_general_logs),
        )
        // Task CRUD and run controls
        .route(
            "/api/tasks",
            get(handlers::tasks::list_tasks).post(handlers::tasks::create_task),
        )
        .route(
            "/api/tasks/:id",
            get(handlers::tasks::get_task)
                .put(handlers::tasks::update_task)
                .delete(handlers::tasks::delete_task),
        )
        .route("/api/tasks/:id/enable", post(handlers::tasks::set_enabled))
        .route("/api/tasks/:id/trigger", post(handlers::tasks::trigger))
        .route(
            "/api/tasks/:id/full-overwrite",
            post(handlers::tasks::full_overwrite),
        )
        .route(
            "/api/tasks/:id/reconstruct",
            post(handlers::tasks::reconstruct),
        )
        .route(
            "/api/tasks/:id/logs",
            get(handlers::tasks::get_logs).delete(handlers::tasks::clear_logs),
        )
        // Cron helpers
        .route("/api/cron/validate", post(handlers::cron::validate))
        .route("/api/cron/presets", get(handlers::cron::presets))
        .route("/api/cron/random", post(handlers::cron::random))
        // Settings
        .route(
            "/api/settings/openlist",
            get(handlers::settings::get_openlist).post(handlers::settings::save_openlist),
        )
        .route(
            "/api/settings/openlist/test",
            post(handlers::settings::test_openlist),
        )
        .route(
            "/api/settings/extensions",
            get(handlers::settings::get_extensions).post(handlers::settings::save_extensions),
        )
        .route(
            "/api/settings/system",
            get(handlers::settings::get_system).post(handlers::settings::save_system),
        )
        .with_state(state)
}

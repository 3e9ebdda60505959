//! Health, status snapshot, queue view, directory browse, general logs.

use axum::extract::{Query, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::dto::{BrowseEntry, BrowseQuery};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::TaskStatus;
use crate::services::log_ring::GENERAL;

/// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "success": true,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /api/status
pub async fn status(State(state): State<SharedState>) -> Result<Json<Value>> {
    let tasks = state.tasks.list().await;
    let mut idle = 0;
    let mut queued = 0;
    let mut running = 0;
    let mut error = 0;
    for task in &tasks {
        match task.status() {
            TaskStatus::Idle => idle += 1,
            TaskStatus::Queued => queued += 1,
            TaskStatus::Running => running += 1,
            TaskStatus::Error => error += 1,
        }
    }

    Ok(Json(json!({
        "success": true,
        "version": env!("CARGO_PKG_VERSION"),
        "task_count": tasks.len(),
        "tasks": { "idle": idle, "queued": queued, "running": running, "error": error },
        "queue_size": state.scheduler.queue_view().len(),
        "running": state.scheduler.running_view(),
    })))
}

/// GET /api/queue
pub async fn queue(State(state): State<SharedState>) -> Result<Json<Value>> {
    Ok(Json(json!({
        "success": true,
        "queue": state.scheduler.queue_view(),
        "running": state.scheduler.running_view(),
    })))
}

/// GET /api/browse?path=/some/dir
///
/// Directory picker backing for the dashboard; lists one level.
pub async fn browse(
    State(_state): State<SharedState>,
    Query(query): Query<BrowseQuery>,
) -> Result<Json<Value>> {
    let path = if query.path.is_empty() { "/" } else { &query.path };

    let mut read_dir = tokio::fs::read_dir(path)
        .await
        .map_err(|e| AppError::NotFound(format!("{path}: {e}")))?;

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let Ok(file_type) = entry.file_type().await else { continue };
        entries.push(BrowseEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: file_type.is_dir(),
        });
    }
    // Directories first, then case-insensitive by name.
    entries.sort_by(|a, b| {
        b.is_dir
            .cmp(&a.is_dir)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok(Json(json!({ "success": true, "path": path, "entries": entries })))
}

/// GET /api/logs
pub async fn general_logs(State(state): State<SharedState>) -> Result<Json<Value>> {
    Ok(Json(json!({ "success": true, "logs": state.ring.get(GENERAL) })))
}

/// DELETE /api/logs
pub async fn clear_general_logs(State(state): State<SharedState>) -> Result<Json<Value>> {
    state.ring.clear(GENERAL);
    Ok(Json(json!({ "success": true })))
}

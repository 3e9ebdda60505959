//! Task CRUD, manual run controls, and per-task log access.

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::dto::{EnabledRequest, TaskView};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::models::{RunKind, Task};

/// GET /api/tasks
pub async fn list_tasks(State(state): State<SharedState>) -> Result<Json<Value>> {
    let tasks: Vec<TaskView> = state
        .tasks
        .list()
        .await
        .into_iter()
        .map(TaskView::from)
        .collect();
    Ok(Json(json!({ "success": true, "tasks": tasks })))
}

/// POST /api/tasks
pub async fn create_task(
    State(state): State<SharedState>,
    Json(task): Json<Task>,
) -> Result<Json<Value>> {
    let task = state.tasks.upsert(task).await?;
    state.scheduler.on_task_changed(task.id()).await;
    state
        .ring
        .info(task.id(), format!("Task created: {}", task.name()));
    Ok(Json(json!({ "success": true, "task": TaskView::from(task) })))
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let task = state
        .tasks
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    Ok(Json(json!({ "success": true, "task": TaskView::from(task) })))
}

/// PUT /api/tasks/:id
pub async fn update_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(mut task): Json<Task>,
) -> Result<Json<Value>> {
    if state.tasks.get(&id).await.is_none() {
        return Err(AppError::NotFound(format!("task {id}")));
    }
    // The path id wins over whatever the body carries.
    match &mut task {
        Task::Sync(t) => t.id = id.clone(),
        Task::Strm(t) => t.id = id.clone(),
    }
    let task = state.tasks.upsert(task).await?;
    state.scheduler.on_task_changed(&id).await;
    Ok(Json(json!({ "success": true, "task": TaskView::from(task) })))
}

/// DELETE /api/tasks/:id
pub async fn delete_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    if !state.tasks.delete(&id).await? {
        return Err(AppError::NotFound(format!("task {id}")));
    }
    state.scheduler.on_task_removed(&id).await;
    state.cache.remove(&id).await;
    state.ring.remove(&id);
    Ok(Json(json!({ "success": true })))
}

/// POST /api/tasks/:id/enable
pub async fn set_enabled(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<EnabledRequest>,
) -> Result<Json<Value>> {
    let task = state.tasks.set_enabled(&id, body.enabled).await?;
    state.scheduler.on_task_changed(&id).await;
    state.ring.info(
        &id,
        format!(
            "Task {}: {}",
            if body.enabled { "enabled" } else { "disabled" },
            task.name()
        ),
    );
    Ok(Json(json!({ "success": true, "task": TaskView::from(task) })))
}

/// POST /api/tasks/:id/trigger
pub async fn trigger(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let task = state
        .tasks
        .get(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;
    state.scheduler.trigger(&id, task.fire_kind()).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/tasks/:id/full-overwrite
pub async fn full_overwrite(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.scheduler.trigger(&id, RunKind::FullOverwrite).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/tasks/:id/reconstruct
pub async fn reconstruct(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.scheduler.trigger(&id, RunKind::Reconstruct).await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/tasks/:id/logs
pub async fn get_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    Ok(Json(json!({ "success": true, "logs": state.ring.get(&id) })))
}

/// DELETE /api/tasks/:id/logs
pub async fn clear_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    state.ring.clear(&id);
    Ok(Json(json!({ "success": true })))
}

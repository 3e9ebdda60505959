//! Global settings endpoints: OpenList connection, extension classes, retry
//! count, plus the connection test.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::dto::{ExtensionsRequest, OpenListSettingsRequest, SystemSettingsRequest};
use crate::api::SharedState;
use crate::error::{AppError, Result};
use crate::services::openlist_client::{OpenListClient, OpenListConfig};

/// GET /api/settings/openlist
///
/// The stored password is never re-served.
pub async fn get_openlist(State(state): State<SharedState>) -> Result<Json<Value>> {
    let settings = state.settings.get().await;
    Ok(Json(json!({
        "success": true,
        "config": {
            "url": settings.openlist.url,
            "username": settings.openlist.username,
            "password": "",
            "token": settings.openlist.token,
            "public_url": settings.openlist.public_url,
        }
    })))
}

/// POST /api/settings/openlist
pub async fn save_openlist(
    State(state): State<SharedState>,
    Json(body): Json<OpenListSettingsRequest>,
) -> Result<Json<Value>> {
    let url = body.url.trim().to_string();
    if url.is_empty() {
        return Err(AppError::InvalidTask("server URL must not be empty".into()));
    }

    state
        .settings
        .update(|settings| {
            settings.openlist.url = url;
            settings.openlist.username = body.username.trim().to_string();
            settings.openlist.token = body.token.trim().to_string();
            settings.openlist.public_url = body.public_url.trim().to_string();
            // An empty password on save keeps the stored one.
            if !body.password.is_empty() {
                settings.openlist.set_password(body.password.trim());
            }
        })
        .await?;

    tracing::info!("OpenList settings saved");
    Ok(Json(json!({ "success": true })))
}

/// POST /api/settings/openlist/test
///
/// Probes the connection with the submitted credentials; empty fields fall
/// back to the stored configuration.
pub async fn test_openlist(
    State(state): State<SharedState>,
    Json(body): Json<OpenListSettingsRequest>,
) -> Result<Json<Value>> {
    let stored = state.settings.get().await.openlist;

    let mut candidate = stored.clone();
    if !body.url.trim().is_empty() {
        candidate.url = body.url.trim().to_string();
    }
    if !body.username.trim().is_empty() {
        candidate.username = body.username.trim().to_string();
    }
    if !body.password.is_empty() {
        candidate.set_password(body.password.trim());
    }
    if !body.token.trim().is_empty() {
        candidate.token = body.token.trim().to_string();
    }

    if candidate.url.is_empty() {
        return Err(AppError::InvalidTask("server URL must not be empty".into()));
    }
    if !candidate.is_configured() {
        return Err(AppError::Auth(
            "provide a token or username and password".into(),
        ));
    }

    let client = OpenListClient::new(OpenListConfig::from_settings(&candidate, false))
        .map_err(AppError::from)?;
    client.test_connection().await.map_err(AppError::from)?;

    Ok(Json(json!({ "success": true, "message": "connection ok" })))
}

/// GET /api/settings/extensions
pub async fn get_extensions(State(state): State<SharedState>) -> Result<Json<Value>> {
    let settings = state.settings.get().await;
    Ok(Json(json!({ "success": true, "extensions": settings.extensions })))
}

/// POST /api/settings/extensions
pub async fn save_extensions(
    State(state): State<SharedState>,
    Json(body): Json<ExtensionsRequest>,
) -> Result<Json<Value>> {
    let settings = state.settings.get().await;
    let mut extensions = settings.extensions.clone();
    if let Some(video) = body.video {
        extensions.video = video.trim().to_string();
    }
    extensions.subtitle = body.subtitle.trim().to_string();
    extensions.image = body.image.trim().to_string();
    extensions.nfo = body.nfo.trim().to_string();
    extensions.other = body.other.trim().to_string();

    extensions
        .validate()
        .map_err(AppError::InvalidTask)?;

    state
        .settings
        .update(|settings| settings.extensions = extensions)
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/settings/system
pub async fn get_system(State(state): State<SharedState>) -> Result<Json<Value>> {
    let settings = state.settings.get().await;
    Ok(Json(json!({
        "success": true,
        "config": { "sync_retry_count": settings.sync_retry_count }
    })))
}

/// POST /api/settings/system
pub async fn save_system(
    State(state): State<SharedState>,
    Json(body): Json<SystemSettingsRequest>,
) -> Result<Json<Value>> {
    let retry_count = body.sync_retry_count.min(10);
    state
        .settings
        .update(|settings| settings.sync_retry_count = retry_count)
        .await?;
    Ok(Json(json!({ "success": true })))
}

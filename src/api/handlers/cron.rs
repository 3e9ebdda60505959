//! Cron expression endpoints: validate, presets, randomized patterns.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::api::dto::{CronRandomRequest, CronValidateRequest};
use crate::api::SharedState;
use crate::error::Result;
use crate::services::cron;

/// POST /api/cron/validate
pub async fn validate(
    State(_state): State<SharedState>,
    Json(body): Json<CronValidateRequest>,
) -> Result<Json<Value>> {
    let description = cron::validate(&body.expression)?;
    let next = cron::next_fire(&body.expression, chrono::Local::now())?;
    Ok(Json(json!({
        "success": true,
        "description": description,
        "next_fire": next.to_rfc3339(),
    })))
}

/// GET /api/cron/presets
pub async fn presets(State(_state): State<SharedState>) -> Json<Value> {
    Json(json!({ "success": true, "presets": cron::presets() }))
}

/// POST /api/cron/random
pub async fn random(
    State(_state): State<SharedState>,
    Json(body): Json<CronRandomRequest>,
) -> Result<Json<Value>> {
    let expression = cron::random_from_pattern(&body.pattern)?;
    Ok(Json(json!({
        "success": true,
        "expression": expression,
        "description": cron::describe(&expression),
    })))
}

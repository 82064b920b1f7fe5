//! /settings handlers.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use veil_services::settings::{STORAGE_FOLDER, TRANSPORT_ANONYMIZE};

use super::{ApiError, ApiState};

#[derive(Serialize)]
pub struct SettingsResponse {
    pub settings: BTreeMap<String, String>,
    /// True while the durable store is unreachable.
    pub degraded: bool,
}

pub async fn handle_settings(State(state): State<ApiState>) -> Json<SettingsResponse> {
    Json(SettingsResponse {
        settings: state.session.settings.all(),
        degraded: state.session.settings.is_degraded(),
    })
}

#[derive(Deserialize)]
pub struct SetRequest {
    pub key: String,
    pub value: String,
}

#[derive(Serialize)]
pub struct SetResponse {
    pub key: String,
    pub value: String,
    /// False when the value is only held in memory.
    pub persisted: bool,
}

/// Reject values the session could not apply.
fn validate(key: &str, value: &str) -> Result<(), String> {
    match key {
        TRANSPORT_ANONYMIZE => value
            .parse::<bool>()
            .map(|_| ())
            .map_err(|_| format!("{key} must be true or false")),
        STORAGE_FOLDER if value.trim().is_empty() => Err(format!("{key} must not be empty")),
        _ if key.trim().is_empty() => Err("key must not be empty".to_string()),
        _ => Ok(()),
    }
}

pub async fn handle_settings_set(
    State(state): State<ApiState>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>, ApiError> {
    validate(&req.key, &req.value).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    let persisted = match state.session.settings.set(&req.key, req.value.clone()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(key = %req.key, error = %e, "setting kept in memory only");
            false
        }
    };
    Ok(Json(SetResponse {
        key: req.key,
        value: req.value,
        persisted,
    }))
}

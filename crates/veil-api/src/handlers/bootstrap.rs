//! /bootstrap, /bootstrap/enable, /bootstrap/disable handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use veil_services::BootstrapPhase;

use super::{ApiError, ApiState};

#[derive(Serialize)]
pub struct BootstrapResponse {
    /// `disabled`, `enabling`, `enabled` or `failed`.
    pub state: &'static str,
    pub error: Option<String>,
    pub anonymize: bool,
    pub tries: u64,
}

fn phase_name(phase: &BootstrapPhase) -> &'static str {
    match phase {
        BootstrapPhase::Disabled => "disabled",
        BootstrapPhase::Enabling => "enabling",
        BootstrapPhase::Enabled => "enabled",
        BootstrapPhase::Failed(_) => "failed",
    }
}

fn describe(state: &ApiState) -> BootstrapResponse {
    let bootstrap = &state.session.bootstrap;
    let phase = bootstrap.phase();
    let error = match &phase {
        BootstrapPhase::Failed(e) => Some(e.to_string()),
        _ => None,
    };
    BootstrapResponse {
        state: phase_name(&phase),
        error,
        anonymize: bootstrap.anonymize(),
        tries: bootstrap.tries(),
    }
}

pub async fn handle_bootstrap(State(state): State<ApiState>) -> Json<BootstrapResponse> {
    Json(describe(&state))
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct EnableRequest {
    pub timeout_ms: Option<u64>,
}

pub async fn handle_enable(
    State(state): State<ApiState>,
    body: Option<Json<EnableRequest>>,
) -> Result<Json<BootstrapResponse>, ApiError> {
    let deadline = body
        .and_then(|Json(req)| req.timeout_ms)
        .map(std::time::Duration::from_millis);
    state
        .session
        .bootstrap
        .enable_with_deadline(deadline)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(describe(&state)))
}

pub async fn handle_disable(State(state): State<ApiState>) -> Json<BootstrapResponse> {
    state.session.bootstrap.disable().await;
    Json(describe(&state))
}

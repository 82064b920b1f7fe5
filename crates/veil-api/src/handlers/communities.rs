//! /communities, /communities/join, /communities/joined, /communities/leave handlers.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};

use veil_core::types::unix_millis;
use veil_core::{CommunityDiscoveryResult, CommunityEngagementSettings, CommunityId, DiscoveryQuery, JoinRequest};

use super::{directory_error, ApiError, ApiState};

/// Upper bound on results returned by one discover call.
const MAX_RESULTS: usize = 500;

// ── /communities ──────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct DiscoverParams {
    pub q: String,
    /// Comma-separated, all must match.
    pub tags: Option<String>,
    pub limit: Option<usize>,
    /// Bound on each page request.
    pub timeout_ms: Option<u64>,
}

impl DiscoverParams {
    fn query(&self) -> DiscoveryQuery {
        let tags = self
            .tags
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();
        DiscoveryQuery {
            text: self.q.clone(),
            tags,
        }
    }
}

#[derive(Serialize)]
pub struct DiscoverResponse {
    pub communities: Vec<CommunityDiscoveryResult>,
}

pub async fn handle_discover(
    State(state): State<ApiState>,
    Query(params): Query<DiscoverParams>,
) -> Result<Json<DiscoverResponse>, ApiError> {
    let limit = params.limit.unwrap_or(MAX_RESULTS).min(MAX_RESULTS);
    let stream = state
        .session
        .directory
        .discover(params.query(), params.timeout_ms.map(Duration::from_millis))
        .map_err(directory_error)?;

    // Pages past the limit are never requested.
    let communities = stream
        .take(limit)
        .try_collect()
        .await
        .map_err(directory_error)?;
    Ok(Json(DiscoverResponse { communities }))
}

// ── /communities/join ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct JoinParams {
    pub community_id: String,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct Membership {
    pub community_id: CommunityId,
    pub identity: String,
    pub display_name: Option<String>,
    pub joined_at_ms: u64,
    pub notify_on_activity: bool,
    pub auto_fetch: bool,
}

impl From<CommunityEngagementSettings> for Membership {
    fn from(m: CommunityEngagementSettings) -> Self {
        Self {
            community_id: m.community_id,
            identity: m.identity,
            display_name: m.display_name,
            joined_at_ms: unix_millis(m.joined_at),
            notify_on_activity: m.notify_on_activity,
            auto_fetch: m.auto_fetch,
        }
    }
}

pub async fn handle_join(
    State(state): State<ApiState>,
    Json(params): Json<JoinParams>,
) -> Result<Json<Membership>, ApiError> {
    let request = JoinRequest {
        community_id: CommunityId(params.community_id),
        identity: params.identity.unwrap_or_else(|| state.identity.clone()),
        display_name: params.display_name,
    };
    let membership = state
        .session
        .directory
        .join_with_deadline(request, params.timeout_ms.map(Duration::from_millis))
        .await
        .map_err(directory_error)?;
    Ok(Json(membership.into()))
}

// ── /communities/joined ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct JoinedResponse {
    pub memberships: Vec<Membership>,
}

pub async fn handle_joined(State(state): State<ApiState>) -> Json<JoinedResponse> {
    let memberships = state
        .session
        .directory
        .memberships()
        .into_iter()
        .map(Membership::from)
        .collect();
    Json(JoinedResponse { memberships })
}

// ── /communities/leave ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LeaveParams {
    pub community_id: String,
    #[serde(default)]
    pub identity: Option<String>,
}

#[derive(Serialize)]
pub struct LeaveResponse {
    pub left: bool,
}

pub async fn handle_leave(
    State(state): State<ApiState>,
    Json(params): Json<LeaveParams>,
) -> Json<LeaveResponse> {
    let identity = params.identity.unwrap_or_else(|| state.identity.clone());
    let left = state
        .session
        .directory
        .leave(&identity, &CommunityId(params.community_id));
    Json(LeaveResponse { left })
}

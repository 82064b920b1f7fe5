//! /health, /metrics, /peers, /store, /daemon/shutdown handlers.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use veil_core::types::unix_millis;
use veil_core::{
    ConnectionState, ConnectionType, HealthStatus, NetworkMetrics, PeerInfo as CorePeerInfo,
};
use veil_services::PeerFilter;

use super::{ApiError, ApiState};

// ── /health ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub connected_peer_count: usize,
    pub anonymizing_transport_enabled: bool,
    pub last_connected_at_ms: Option<u64>,
    pub error_message: Option<String>,
    pub settings_degraded: bool,
}

pub async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let health = state.session.health.snapshot();
    Json(HealthResponse {
        status: health.status,
        connected_peer_count: health.connected_peer_count,
        anonymizing_transport_enabled: health.anonymizing_transport_enabled,
        last_connected_at_ms: health.last_connected_at.map(unix_millis),
        error_message: health.error_message,
        settings_degraded: state.session.settings.is_degraded(),
    })
}

// ── /metrics ─────────────────────────────────────────────────────────────────

pub async fn handle_metrics(State(state): State<ApiState>) -> Json<NetworkMetrics> {
    Json(state.session.health.metrics())
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct PeersQuery {
    pub state: Option<ConnectionState>,
    pub connection_type: Option<ConnectionType>,
    pub anonymous_only: bool,
}

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub address: String,
    pub state: ConnectionState,
    pub connection_type: ConnectionType,
    pub is_anonymous: bool,
    pub last_seen_ms: u64,
}

impl From<CorePeerInfo> for PeerInfo {
    fn from(p: CorePeerInfo) -> Self {
        Self {
            peer_id: p.peer_id.to_string(),
            address: p.address,
            state: p.state,
            connection_type: p.connection_type,
            is_anonymous: p.is_anonymous,
            last_seen_ms: unix_millis(p.last_seen),
        }
    }
}

pub async fn handle_peers(
    State(state): State<ApiState>,
    Query(query): Query<PeersQuery>,
) -> Json<PeersResponse> {
    let filter = PeerFilter {
        state: query.state,
        connection_type: query.connection_type,
        anonymous_only: query.anonymous_only,
    };
    let peers = state
        .session
        .registry
        .list(Some(&filter))
        .into_iter()
        .map(PeerInfo::from)
        .collect();
    Json(PeersResponse { peers })
}

// ── /store ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StoreResponse {
    pub root: String,
    pub items: usize,
    pub bytes: u64,
}

pub async fn handle_store(State(state): State<ApiState>) -> Json<StoreResponse> {
    let store = state.session.transfers.store();
    Json(StoreResponse {
        root: store.root().display().to_string(),
        items: store.count(),
        bytes: store.size(),
    })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(
    State(state): State<ApiState>,
) -> Result<Json<ShutdownResponse>, ApiError> {
    tracing::info!("shutdown requested via API");
    state.shutdown_tx.send(()).map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "daemon is already shutting down".to_string(),
        )
    })?;
    Ok(Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use veil_core::PeerId;

    #[test]
    fn peer_view_uses_hex_id_and_millis() {
        let id = PeerId([7; 32]);
        let view = PeerInfo::from(CorePeerInfo {
            peer_id: id,
            address: "10.0.0.9:7420".into(),
            state: ConnectionState::Connected,
            last_seen: UNIX_EPOCH + Duration::from_millis(1_500),
            connection_type: ConnectionType::AnonymizedRelay,
            is_anonymous: true,
        });
        assert_eq!(view.peer_id, "07".repeat(32));
        assert_eq!(view.last_seen_ms, 1_500);

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["connection_type"], "anonymized_relay");
    }

    #[test]
    fn peers_query_accepts_lowercase_state() {
        let q: PeersQuery = serde_json::from_str(r#"{"state":"connecting"}"#).unwrap();
        assert_eq!(q.state, Some(ConnectionState::Connecting));
        assert!(!q.anonymous_only);
    }
}

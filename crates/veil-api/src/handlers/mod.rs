//! HTTP API handlers: expose a running session as JSON.

pub mod bootstrap;
pub mod communities;
pub mod settings;
pub mod status;
pub mod transfers;

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;

use veil_core::{ContentHash, DirectoryError, TransferError};
use veil_services::Session;

#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<Session>,
    /// Identity used for community joins when the request names none.
    pub identity: String,
    /// Where uploaded files are staged before they are published.
    pub upload_dir: PathBuf,
    /// Signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

pub type ApiError = (StatusCode, String);

// ── Shared helpers ────────────────────────────────────────────────────────────

fn parse_hash(hex_str: &str) -> Result<ContentHash, ApiError> {
    hex_str
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid hash: {e}")))
}

fn transfer_status(e: &TransferError) -> StatusCode {
    match e {
        TransferError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        TransferError::NotFound => StatusCode::NOT_FOUND,
        TransferError::HashMismatch { .. } => StatusCode::BAD_GATEWAY,
        TransferError::IoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        TransferError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        TransferError::Cancelled => StatusCode::CONFLICT,
    }
}

fn transfer_error(e: TransferError) -> ApiError {
    (transfer_status(&e), e.to_string())
}

fn directory_error(e: DirectoryError) -> ApiError {
    let status = match e {
        DirectoryError::TransportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        DirectoryError::QueryFailed(_) => StatusCode::BAD_GATEWAY,
        DirectoryError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
    };
    (status, e.to_string())
}

// Re-export handler functions for use in router setup.
pub use bootstrap::{handle_bootstrap, handle_disable, handle_enable};
pub use communities::{handle_discover, handle_join, handle_joined, handle_leave};
pub use settings::{handle_settings, handle_settings_set};
pub use status::{handle_health, handle_metrics, handle_peers, handle_shutdown, handle_store};
pub use transfers::{
    handle_cancel, handle_fetch, handle_publish, handle_seed, handle_transfers, handle_upload,
};

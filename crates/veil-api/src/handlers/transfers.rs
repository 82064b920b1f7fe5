//! /transfers, /publish, /publish/upload, /fetch, /seed, /transfers/cancel handlers.

use std::path::PathBuf;
use std::time::Duration;

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use veil_core::{TransferDirection, TransferOperation};

use super::{parse_hash, transfer_error, ApiError, ApiState};

/// Maximum upload size per file (256 MB).
const MAX_UPLOAD_BYTES: u64 = 256 * 1024 * 1024;

// ── /transfers ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TransfersResponse {
    pub active: Vec<TransferOperation>,
    pub recent: Vec<TransferOperation>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub async fn handle_transfers(State(state): State<ApiState>) -> Json<TransfersResponse> {
    let transfers = &state.session.transfers;
    Json(TransfersResponse {
        active: transfers.operations(),
        recent: transfers.history(),
        bytes_sent: transfers.bytes_sent(),
        bytes_received: transfers.bytes_received(),
    })
}

// ── /publish ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PublishRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct PublishResponse {
    pub hash: String,
    pub path: String,
}

pub async fn handle_publish(
    State(state): State<ApiState>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let hash = state
        .session
        .transfers
        .publish_with_deadline(req.path.clone(), req.timeout_ms.map(Duration::from_millis))
        .await
        .map_err(transfer_error)?;
    Ok(Json(PublishResponse {
        hash: hash.to_hex(),
        path: req.path.display().to_string(),
    }))
}

/// Multipart upload: the file is staged in the upload directory, then
/// published like any local file.
pub async fn handle_upload(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<PublishResponse>, ApiError> {
    let mut field = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        .ok_or((StatusCode::BAD_REQUEST, "no file data".to_string()))?;
    let path = {
        let filename = sanitize_filename(field.file_name().unwrap_or(""));
        tokio::fs::create_dir_all(&state.upload_dir)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        let path = state.upload_dir.join(&filename);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        let mut written = 0u64;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        {
            written += chunk.len() as u64;
            if written > MAX_UPLOAD_BYTES {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                return Err((
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("file exceeds {} byte limit", MAX_UPLOAD_BYTES),
                ));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        path
    };

    let hash = state
        .session
        .transfers
        .publish(path.clone())
        .await
        .map_err(transfer_error)?;
    tracing::info!(path = %path.display(), hash = %hash.short(), "upload published");
    Ok(Json(PublishResponse {
        hash: hash.to_hex(),
        path: path.display().to_string(),
    }))
}

/// Sanitize a filename: strip path components, reject traversal attempts.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let trimmed = base.trim_start_matches('.');
    let clean: String = trimmed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if clean.is_empty() {
        "upload".to_string()
    } else {
        clean
    }
}

// ── /fetch ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FetchRequest {
    pub hash: String,
    pub dest: PathBuf,
    /// Caller-side deadline. The transfer keeps running for other observers.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct FetchResponse {
    pub hash: String,
    pub dest: String,
}

pub async fn handle_fetch(
    State(state): State<ApiState>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<FetchResponse>, ApiError> {
    let hash = parse_hash(&req.hash)?;
    state
        .session
        .transfers
        .fetch_with_deadline(hash, req.dest.clone(), req.timeout_ms.map(Duration::from_millis))
        .await
        .map_err(transfer_error)?;
    Ok(Json(FetchResponse {
        hash: hash.to_hex(),
        dest: req.dest.display().to_string(),
    }))
}

// ── /seed ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SeedRequest {
    pub dir: PathBuf,
    /// Bounds the whole seed; files still publishing report a timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct SeedResponse {
    pub results: Vec<SeedItem>,
    pub published: usize,
    pub failed: usize,
}

#[derive(Serialize)]
pub struct SeedItem {
    pub path: String,
    pub hash: Option<String>,
    pub error: Option<String>,
}

pub async fn handle_seed(
    State(state): State<ApiState>,
    Json(req): Json<SeedRequest>,
) -> Result<Json<SeedResponse>, ApiError> {
    let results = state
        .session
        .transfers
        .seed_folder_with_deadline(&req.dir, req.timeout_ms.map(Duration::from_millis))
        .await
        .map_err(transfer_error)?;

    let results: Vec<SeedItem> = results
        .into_iter()
        .map(|r| SeedItem {
            path: r.path.display().to_string(),
            hash: r.result.as_ref().ok().map(|h| h.to_hex()),
            error: r.result.err().map(|e| e.to_string()),
        })
        .collect();
    let failed = results.iter().filter(|r| r.error.is_some()).count();
    Ok(Json(SeedResponse {
        published: results.len() - failed,
        failed,
        results,
    }))
}

// ── /transfers/cancel ─────────────────────────────────────────────────────────

/// Either `id`, or `hash` with an optional `direction` (default fetch).
#[derive(Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub direction: Option<TransferDirection>,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

pub async fn handle_cancel(
    State(state): State<ApiState>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, ApiError> {
    let transfers = &state.session.transfers;
    let cancelled = match (req.id, req.hash) {
        (Some(id), _) => transfers.cancel_id(id),
        (None, Some(hash)) => {
            let hash = parse_hash(&hash)?;
            transfers.cancel(&hash, req.direction.unwrap_or(TransferDirection::Fetch))
        }
        (None, None) => {
            return Err((
                StatusCode::BAD_REQUEST,
                "either id or hash is required".to_string(),
            ))
        }
    };
    Ok(Json(CancelResponse { cancelled }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_traversal() {
        assert_eq!(sanitize_filename("../../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("..\\..\\windows\\system32"), "system32");
    }

    #[test]
    fn sanitize_handles_hidden_and_empty() {
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("..."), "upload");
        assert_eq!(sanitize_filename("field notes (2).txt"), "field_notes__2_.txt");
    }

    #[test]
    fn cancel_request_direction_is_lowercase() {
        let req: CancelRequest =
            serde_json::from_str(r#"{"hash":"00","direction":"publish"}"#).unwrap();
        assert_eq!(req.direction, Some(TransferDirection::Publish));
        assert!(req.id.is_none());
    }
}

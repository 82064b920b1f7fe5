//! Publish, fetch, seed, and transfer bookkeeping commands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::format_bytes;
use super::http::{base_url, get_json, post_json_body, post_multipart};

#[derive(Deserialize)]
struct TransfersResponse {
    active: Vec<Operation>,
    recent: Vec<Operation>,
    bytes_sent: u64,
    bytes_received: u64,
}

#[derive(Deserialize)]
struct Operation {
    id: u64,
    hash: String,
    direction: String,
    state: String,
    bytes_transferred: u64,
    total_bytes: Option<u64>,
    path: PathBuf,
    retry_count: u32,
    error: Option<String>,
}

#[derive(Deserialize)]
struct PublishResponse {
    hash: String,
    path: String,
}

#[derive(Serialize)]
struct FetchRequest {
    hash: String,
    dest: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct FetchResponse {
    hash: String,
    dest: String,
}

#[derive(Deserialize)]
struct SeedResponse {
    results: Vec<SeedItem>,
    published: usize,
    failed: usize,
}

#[derive(Deserialize)]
struct SeedItem {
    path: String,
    hash: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct CancelResponse {
    cancelled: bool,
}

/// The daemon resolves paths against its own working directory.
fn absolute(path: &str) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("bad path: {}", path))
}

fn print_operation(op: &Operation) {
    let progress = match op.total_bytes {
        Some(total) if total > 0 => format!(
            "{} / {} ({:.0}%)",
            format_bytes(op.bytes_transferred),
            format_bytes(total),
            op.bytes_transferred as f64 * 100.0 / total as f64
        ),
        _ => format_bytes(op.bytes_transferred),
    };
    println!("  ┌─ #{} {} {}", op.id, op.direction, &op.hash[..16.min(op.hash.len())]);
    println!("  │  state    : {}", op.state);
    println!("  │  path     : {}", op.path.display());
    if op.retry_count > 0 {
        println!("  │  retries  : {}", op.retry_count);
    }
    if let Some(err) = &op.error {
        println!("  │  error    : {}", err);
    }
    println!("  └─ progress : {}", progress);
}

pub async fn cmd_transfers(port: u16) -> Result<()> {
    let resp: TransfersResponse = get_json(&format!("{}/transfers", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Transfers");
    println!("═══════════════════════════════════════");
    println!("  Sent     : {}", format_bytes(resp.bytes_sent));
    println!("  Received : {}", format_bytes(resp.bytes_received));

    if resp.active.is_empty() {
        println!("\n  No active transfers.");
    } else {
        println!("\n  Active:");
        resp.active.iter().for_each(print_operation);
    }
    if !resp.recent.is_empty() {
        println!("\n  Recent:");
        resp.recent.iter().for_each(print_operation);
    }
    Ok(())
}

pub async fn cmd_publish(port: u16, path: &str) -> Result<()> {
    let resp: PublishResponse = post_json_body(
        &format!("{}/publish", base_url(port)),
        &json!({ "path": absolute(path)? }),
    )
    .await?;
    println!("Published {}", resp.path);
    println!("  Hash : {}", resp.hash);
    Ok(())
}

/// Send the file bytes to the daemon instead of a path.
pub async fn cmd_upload(port: u16, path: &str) -> Result<()> {
    use reqwest::multipart;

    let file_data =
        std::fs::read(path).with_context(|| format!("failed to read file: {}", path))?;
    let filename = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();
    let size = file_data.len() as u64;

    let form = multipart::Form::new().part("file", multipart::Part::bytes(file_data).file_name(filename));
    let resp: PublishResponse =
        post_multipart(&format!("{}/publish/upload", base_url(port)), form).await?;

    println!("Uploaded and published {} ({})", resp.path, format_bytes(size));
    println!("  Hash : {}", resp.hash);
    Ok(())
}

pub async fn cmd_fetch(port: u16, hash: &str, dest: &str, timeout_ms: Option<u64>) -> Result<()> {
    let req = FetchRequest {
        hash: hash.to_string(),
        dest: absolute(dest)?,
        timeout_ms,
    };
    let resp: FetchResponse = post_json_body(&format!("{}/fetch", base_url(port)), &req).await?;
    println!("Fetched {}", resp.hash);
    println!("  Saved to : {}", resp.dest);
    Ok(())
}

pub async fn cmd_seed(port: u16, dir: &str) -> Result<()> {
    let resp: SeedResponse = post_json_body(
        &format!("{}/seed", base_url(port)),
        &json!({ "dir": absolute(dir)? }),
    )
    .await?;

    for item in &resp.results {
        match (&item.hash, &item.error) {
            (Some(hash), _) => println!("  ✓ {} {}", &hash[..16.min(hash.len())], item.path),
            (None, Some(err)) => println!("  ✗ {} ({})", item.path, err),
            (None, None) => println!("  ? {}", item.path),
        }
    }
    println!("\nSeeded {} file(s), {} failed.", resp.published, resp.failed);
    Ok(())
}

pub async fn cmd_cancel(port: u16, target: &str, direction: Option<&str>) -> Result<()> {
    let body = match target.parse::<u64>() {
        Ok(id) => json!({ "id": id }),
        Err(_) => json!({ "hash": target, "direction": direction }),
    };
    let resp: CancelResponse =
        post_json_body(&format!("{}/transfers/cancel", base_url(port)), &body).await?;
    if resp.cancelled {
        println!("Cancelled {}.", target);
    } else {
        println!("No active transfer matches {}.", target);
    }
    Ok(())
}

//! Node health, peers, store, settings, and shutdown commands.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::http::{base_url, get_json, post_json, post_json_body, url_with_params};
use super::format_bytes;

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct HealthResponse {
    status: String,
    connected_peer_count: usize,
    anonymizing_transport_enabled: bool,
    last_connected_at_ms: Option<u64>,
    error_message: Option<String>,
    settings_degraded: bool,
}

#[derive(Deserialize)]
struct MetricsResponse {
    download_rate_bps: f64,
    upload_rate_bps: f64,
    average_latency_ms: f64,
    success_rate: f64,
    total_connections: usize,
    active_connections: usize,
    bytes_sent: u64,
    bytes_received: u64,
}

#[derive(Deserialize)]
struct StoreResponse {
    root: String,
    items: usize,
    bytes: u64,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
struct PeerInfo {
    peer_id: String,
    address: String,
    state: String,
    connection_type: String,
    is_anonymous: bool,
    last_seen_ms: u64,
}

#[derive(Deserialize)]
struct SettingsResponse {
    settings: BTreeMap<String, String>,
    degraded: bool,
}

#[derive(Serialize)]
struct SetRequest<'a> {
    key: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct SetResponse {
    key: String,
    value: String,
    persisted: bool,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let health: HealthResponse = get_json(&format!("{}/health", base_url(port))).await?;
    let metrics: MetricsResponse = get_json(&format!("{}/metrics", base_url(port))).await?;
    let store: StoreResponse = get_json(&format!("{}/store", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Veil Node Status");
    println!("═══════════════════════════════════════");
    println!("  Network          : {}", health.status);
    println!("  Connected peers  : {}", health.connected_peer_count);
    println!(
        "  Anonymizing      : {}",
        if health.anonymizing_transport_enabled { "on" } else { "off" }
    );
    if let Some(ms) = health.last_connected_at_ms {
        println!("  Last connected   : {} ms since epoch", ms);
    }
    if let Some(err) = &health.error_message {
        println!("  Error            : {}", err);
    }
    if health.settings_degraded {
        println!("  Settings         : not persisted (backend unreachable)");
    }

    println!("\n  Throughput:");
    println!("  ┌─ down     : {}/s", format_bytes(metrics.download_rate_bps as u64));
    println!("  │  up       : {}/s", format_bytes(metrics.upload_rate_bps as u64));
    println!("  │  latency  : {:.1} ms", metrics.average_latency_ms);
    println!("  │  success  : {:.0}%", metrics.success_rate * 100.0);
    println!(
        "  │  peers    : {} active / {} known",
        metrics.active_connections, metrics.total_connections
    );
    println!(
        "  └─ totals   : {} sent, {} received",
        format_bytes(metrics.bytes_sent),
        format_bytes(metrics.bytes_received)
    );

    println!("\n  Store:");
    println!("  ┌─ root     : {}", store.root);
    println!("  │  items    : {}", store.items);
    println!("  └─ size     : {}", format_bytes(store.bytes));

    Ok(())
}

pub async fn cmd_peers(port: u16, state: Option<&str>, anonymous_only: bool) -> Result<()> {
    let url = url_with_params(
        port,
        "/peers",
        &[
            ("state", state.unwrap_or_default().to_string()),
            (
                "anonymous_only",
                if anonymous_only { "true".to_string() } else { String::new() },
            ),
        ],
    )?;
    let resp: PeersResponse = get_json(&url).await?;

    if resp.peers.is_empty() {
        println!("No peers known yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Peers ({})", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        let icon = match p.state.as_str() {
            "connected" => "✓",
            "error" => "✗",
            _ => "·",
        };
        println!("  ┌─ {} {}", icon, &p.peer_id[..16.min(p.peer_id.len())]);
        println!("  │  address   : {}", p.address);
        println!("  │  state     : {}", p.state);
        println!("  │  transport : {}", p.connection_type);
        if p.is_anonymous {
            println!("  │  anonymous : yes");
        }
        println!("  └─ last seen : {} ms since epoch", p.last_seen_ms);
    }

    Ok(())
}

pub async fn cmd_settings(port: u16) -> Result<()> {
    let resp: SettingsResponse = get_json(&format!("{}/settings", base_url(port))).await?;

    if resp.settings.is_empty() {
        println!("No settings stored.");
    }
    for (key, value) in &resp.settings {
        println!("  {:<28} {}", key, value);
    }
    if resp.degraded {
        println!("\n  Warning: recent changes were not persisted.");
    }
    Ok(())
}

pub async fn cmd_set(port: u16, key: &str, value: &str) -> Result<()> {
    let resp: SetResponse = post_json_body(
        &format!("{}/settings", base_url(port)),
        &SetRequest { key, value },
    )
    .await?;
    println!("{} = {}", resp.key, resp.value);
    if !resp.persisted {
        println!("Warning: applied for this run but not persisted.");
    }
    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    #[derive(Deserialize)]
    struct ShutdownResponse {
        message: String,
    }

    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}

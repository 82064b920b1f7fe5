//! Bootstrap control.

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;

use super::http::{base_url, get_json, post_json, post_json_body};

#[derive(Deserialize)]
struct BootstrapResponse {
    state: String,
    error: Option<String>,
    anonymize: bool,
    tries: u64,
}

fn print_bootstrap(resp: &BootstrapResponse) {
    println!("  State     : {}", resp.state);
    println!("  Anonymize : {}", if resp.anonymize { "on" } else { "off" });
    println!("  Attempts  : {}", resp.tries);
    if let Some(err) = &resp.error {
        println!("  Error     : {}", err);
    }
}

pub async fn cmd_bootstrap(port: u16) -> Result<()> {
    let resp: BootstrapResponse = get_json(&format!("{}/bootstrap", base_url(port))).await?;
    print_bootstrap(&resp);
    Ok(())
}

pub async fn cmd_enable(port: u16, timeout_ms: Option<u64>) -> Result<()> {
    let resp: BootstrapResponse = post_json_body(
        &format!("{}/bootstrap/enable", base_url(port)),
        &json!({ "timeout_ms": timeout_ms }),
    )
    .await?;
    println!("Network enabled.");
    print_bootstrap(&resp);
    Ok(())
}

pub async fn cmd_disable(port: u16) -> Result<()> {
    let resp: BootstrapResponse = post_json(&format!("{}/bootstrap/disable", base_url(port))).await?;
    println!("Network disabled.");
    print_bootstrap(&resp);
    Ok(())
}

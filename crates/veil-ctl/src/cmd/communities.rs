//! Community discovery and membership commands.

use anyhow::Result;
use serde::Deserialize;
use serde_json::json;

use super::http::{base_url, get_json, post_json_body, url_with_params};

#[derive(Deserialize)]
struct DiscoverResponse {
    communities: Vec<Community>,
}

#[derive(Deserialize)]
struct Community {
    community_id: String,
    name: String,
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    member_count: u64,
    host: Option<String>,
}

#[derive(Deserialize)]
struct Membership {
    community_id: String,
    identity: String,
    display_name: Option<String>,
    joined_at_ms: u64,
    notify_on_activity: bool,
    auto_fetch: bool,
}

#[derive(Deserialize)]
struct JoinedResponse {
    memberships: Vec<Membership>,
}

#[derive(Deserialize)]
struct LeaveResponse {
    left: bool,
}

pub async fn cmd_discover(port: u16, text: &str, tags: Option<&str>, limit: Option<usize>) -> Result<()> {
    let url = url_with_params(
        port,
        "/communities",
        &[
            ("q", text.to_string()),
            ("tags", tags.unwrap_or_default().to_string()),
            ("limit", limit.map(|l| l.to_string()).unwrap_or_default()),
        ],
    )?;
    let resp: DiscoverResponse = get_json(&url).await?;

    if resp.communities.is_empty() {
        println!("No communities found.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Communities ({})", resp.communities.len());
    println!("═══════════════════════════════════════");
    for c in &resp.communities {
        println!("  ┌─ {} ({})", c.name, c.community_id);
        if !c.description.is_empty() {
            println!("  │  {}", c.description);
        }
        if !c.tags.is_empty() {
            println!("  │  tags    : {}", c.tags.join(", "));
        }
        if let Some(host) = &c.host {
            println!("  │  host    : {}", &host[..16.min(host.len())]);
        }
        println!("  └─ members : {}", c.member_count);
    }
    Ok(())
}

pub async fn cmd_join(port: u16, community: &str, display_name: Option<&str>) -> Result<()> {
    let m: Membership = post_json_body(
        &format!("{}/communities/join", base_url(port)),
        &json!({ "community_id": community, "display_name": display_name }),
    )
    .await?;
    println!("Joined {} as {}.", m.community_id, m.identity);
    Ok(())
}

pub async fn cmd_joined(port: u16) -> Result<()> {
    let resp: JoinedResponse = get_json(&format!("{}/communities/joined", base_url(port))).await?;

    if resp.memberships.is_empty() {
        println!("Not a member of any community.");
        return Ok(());
    }
    for m in &resp.memberships {
        println!("  ┌─ {}", m.community_id);
        println!(
            "  │  identity : {}{}",
            m.identity,
            m.display_name
                .as_deref()
                .map(|n| format!(" ({n})"))
                .unwrap_or_default()
        );
        println!("  │  notify   : {}", m.notify_on_activity);
        println!("  │  autofetch: {}", m.auto_fetch);
        println!("  └─ joined   : {} ms since epoch", m.joined_at_ms);
    }
    Ok(())
}

pub async fn cmd_leave(port: u16, community: &str) -> Result<()> {
    let resp: LeaveResponse = post_json_body(
        &format!("{}/communities/leave", base_url(port)),
        &json!({ "community_id": community }),
    )
    .await?;
    if resp.left {
        println!("Left {}.", community);
    } else {
        println!("Not a member of {}.", community);
    }
    Ok(())
}

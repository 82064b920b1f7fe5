//! Data model shared by the session core, the API, and the overlay transport.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::ContentHash;

/// Milliseconds since the unix epoch. Clamps pre-epoch times to 0.
pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Peers ─────────────────────────────────────────────────────────────────────

/// Stable, opaque peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("peer id is not hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("peer id has {} bytes, expected 32", b.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Per-peer connection lifecycle.
///
/// ```text
/// Discovered → Connecting → Connected → {Disconnected, Error}
///                  ↑  │                       │
///                  │  └──→ {Disconnected, Error}
///                  └──────────────────────────┘ (reconnect)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Direct,
    AnonymizedRelay,
    Relay,
}

impl ConnectionType {
    /// Lower is preferred when choosing a peer to pull from.
    pub fn preference(self) -> u8 {
        match self {
            ConnectionType::Direct => 0,
            ConnectionType::AnonymizedRelay => 1,
            ConnectionType::Relay => 2,
        }
    }
}

/// Registry entry for one peer. Consumers only ever see copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub address: String,
    pub state: ConnectionState,
    pub last_seen: SystemTime,
    pub connection_type: ConnectionType,
    pub is_anonymous: bool,
}

// ── Transfers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Publish,
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Snapshot of a publish or fetch operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOperation {
    pub id: u64,
    pub hash: ContentHash,
    pub direction: TransferDirection,
    pub state: TransferState,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    /// Source path for publish, destination path for fetch.
    pub path: PathBuf,
    pub retry_count: u32,
    pub peer: Option<PeerId>,
    pub started_at: SystemTime,
    pub first_byte_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub error: Option<String>,
}

impl TransferOperation {
    pub fn new(id: u64, hash: ContentHash, direction: TransferDirection, path: PathBuf) -> Self {
        Self {
            id,
            hash,
            direction,
            state: TransferState::Queued,
            bytes_transferred: 0,
            total_bytes: None,
            path,
            retry_count: 0,
            peer: None,
            started_at: SystemTime::now(),
            first_byte_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Time from start to first byte, if any byte moved.
    pub fn latency(&self) -> Option<Duration> {
        self.first_byte_at
            .and_then(|t| t.duration_since(self.started_at).ok())
    }

    /// Wall time from start to terminal state.
    pub fn elapsed(&self) -> Option<Duration> {
        self.finished_at
            .and_then(|t| t.duration_since(self.started_at).ok())
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkHealth {
    pub status: HealthStatus,
    pub connected_peer_count: usize,
    pub anonymizing_transport_enabled: bool,
    pub last_connected_at: Option<SystemTime>,
    pub error_message: Option<String>,
}

impl Default for NetworkHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            connected_peer_count: 0,
            anonymizing_transport_enabled: false,
            last_connected_at: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub download_rate_bps: f64,
    pub upload_rate_bps: f64,
    pub average_latency_ms: f64,
    /// In `[0, 1]`.
    pub success_rate: f64,
    pub total_connections: usize,
    pub active_connections: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            download_rate_bps: 0.0,
            upload_rate_bps: 0.0,
            average_latency_ms: 0.0,
            success_rate: 1.0,
            total_connections: 0,
            active_connections: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

// ── Communities ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommunityId(pub String);

impl fmt::Display for CommunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommunityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryQuery {
    /// Case-insensitive substring matched against name and description.
    pub text: String,
    /// Every listed tag must be present on a result.
    pub tags: Vec<String>,
}

impl DiscoveryQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityDiscoveryResult {
    pub community_id: CommunityId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub member_count: u64,
    #[serde(default)]
    pub host: Option<PeerId>,
}

impl CommunityDiscoveryResult {
    pub fn matches(&self, query: &DiscoveryQuery) -> bool {
        let needle = query.text.to_lowercase();
        let text_ok = needle.is_empty()
            || self.name.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle);
        let tags_ok = query
            .tags
            .iter()
            .all(|t| self.tags.iter().any(|own| own.eq_ignore_ascii_case(t)));
        text_ok && tags_ok
    }
}

/// One page of discovery results as returned by the overlay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPage {
    pub results: Vec<CommunityDiscoveryResult>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub community_id: CommunityId,
    /// Local identity joining the community.
    pub identity: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Membership record produced by a successful join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityEngagementSettings {
    pub community_id: CommunityId,
    pub identity: String,
    pub display_name: Option<String>,
    pub joined_at: SystemTime,
    pub notify_on_activity: bool,
    pub auto_fetch: bool,
}

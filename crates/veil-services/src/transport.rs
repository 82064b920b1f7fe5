//! Injected transport capabilities.
//!
//! The session core never owns sockets or the anonymizing layer. Hosts hand
//! it a `Transport`, and the transport reports connection lifecycle through
//! the `PeerEventSink` it receives on bring-up.

use futures::future::BoxFuture;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use veil_core::{
    CommunityEngagementSettings, ConnectionError, ConnectionType, ContentHash, DiscoveryPage,
    DiscoveryQuery, JoinRequest, NetworkError, PeerId,
};

/// Connection events, as emitted by the transport for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Discovered {
        address: String,
        connection_type: ConnectionType,
        is_anonymous: bool,
    },
    Connecting,
    Connected,
    Disconnected,
    Failed(ConnectionError),
    /// Liveness signal; refreshes `last_seen` without a state change.
    Heartbeat,
}

impl PeerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PeerEvent::Discovered { .. } => "discovered",
            PeerEvent::Connecting => "connecting",
            PeerEvent::Connected => "connected",
            PeerEvent::Disconnected => "disconnected",
            PeerEvent::Failed(_) => "failed",
            PeerEvent::Heartbeat => "heartbeat",
        }
    }
}

/// Ordered stream of connection events into the registry.
pub type PeerEventSink = mpsc::UnboundedSender<(PeerId, PeerEvent)>;

/// A readable content body served by some peer.
pub struct ContentStream {
    /// Peer that is serving the bytes, if known.
    pub peer: Option<PeerId>,
    /// Advertised length. Never trusted for verification.
    pub size_hint: Option<u64>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// Network capabilities the session core depends on.
pub trait Transport: Send + Sync {
    /// Bring the overlay (and, when `anonymize`, the anonymizing layer) online.
    fn bring_up(&self, anonymize: bool, events: PeerEventSink)
        -> BoxFuture<'_, Result<(), NetworkError>>;

    /// Tear everything down. Must be safe to call when already down.
    fn tear_down(&self) -> BoxFuture<'_, ()>;

    /// Advertise locally available content.
    fn announce(&self, hash: ContentHash, size: u64) -> BoxFuture<'_, Result<(), NetworkError>>;

    /// Open a content body. `peer = None` lets the transport route.
    fn open_content(
        &self,
        peer: Option<PeerId>,
        hash: ContentHash,
    ) -> BoxFuture<'_, Result<ContentStream, NetworkError>>;

    /// Fetch one page of community discovery results.
    fn query_communities<'a>(
        &'a self,
        query: &'a DiscoveryQuery,
        cursor: Option<String>,
        page_size: usize,
    ) -> BoxFuture<'a, Result<DiscoveryPage, NetworkError>>;

    fn join_community<'a>(
        &'a self,
        request: &'a JoinRequest,
    ) -> BoxFuture<'a, Result<CommunityEngagementSettings, NetworkError>>;
}

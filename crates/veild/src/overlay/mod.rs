//! TCP overlay transport.
//!
//! Long-lived links carry `Hello`, `Heartbeat` and `Announce` frames and
//! drive the peer lifecycle events. Content, community queries and joins
//! each use a short request connection: one request frame, one response,
//! then close. With anonymizing enabled every outbound connection goes
//! through the SOCKS5 proxy.

mod frames;
mod link;
mod server;
mod socks;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use veil_core::config::{HostedCommunity, VeilConfig};
use veil_core::wire::{self, Message};
use veil_core::{
    CommunityEngagementSettings, ConnectionError, ConnectionType, ContentHash, DiscoveryPage,
    DiscoveryQuery, JoinRequest, NetworkError, PeerId,
};
use veil_services::{ContentStore, ContentStream, PeerEvent, PeerEventSink, Transport};

use frames::{read_message, write_message, ChannelReader};

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub node_id: PeerId,
    pub listen_addr: String,
    pub listen_port: u16,
    pub bootstrap_peers: Vec<String>,
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub socks_proxy: String,
    pub hosted: Vec<HostedCommunity>,
}

impl OverlayConfig {
    pub fn from_config(node_id: PeerId, config: &VeilConfig) -> Self {
        Self {
            node_id,
            listen_addr: config.network.listen_addr.clone(),
            listen_port: config.network.listen_port,
            bootstrap_peers: config.network.bootstrap_peers.clone(),
            heartbeat: Duration::from_secs(config.network.heartbeat_interval_secs.max(1)),
            connect_timeout: Duration::from_millis(config.network.connect_timeout_ms),
            socks_proxy: config.transport.socks_proxy.clone(),
            hosted: config.directory.hosted.clone(),
        }
    }
}

struct Link {
    /// Listen address of the remote node.
    address: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

struct Running {
    events: PeerEventSink,
    anonymize: bool,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    config: OverlayConfig,
    store: ContentStore,
    uploads: mpsc::UnboundedSender<u64>,
    running: Mutex<Option<Running>>,
    links: DashMap<PeerId, Link>,
    /// Last known peer id behind each dialed address.
    known: DashMap<String, PeerId>,
    announcers: DashMap<ContentHash, Vec<PeerId>>,
    members: DashMap<String, BTreeSet<String>>,
}

#[derive(Clone)]
pub struct OverlayTransport {
    inner: Arc<Inner>,
}

impl OverlayTransport {
    /// The receiver yields byte counts served to other peers.
    pub fn new(config: OverlayConfig, store: ContentStore) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (uploads, uploads_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(Inner {
                config,
                store,
                uploads,
                running: Mutex::new(None),
                links: DashMap::new(),
                known: DashMap::new(),
                announcers: DashMap::new(),
                members: DashMap::new(),
            }),
        };
        (transport, uploads_rx)
    }

    /// Bound listener address while the overlay is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }
}

impl Inner {
    fn emit(&self, peer: PeerId, event: PeerEvent) {
        if let Some(running) = self.running.lock().as_ref() {
            let _ = running.events.send((peer, event));
        }
    }

    fn anonymize(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|r| r.anonymize)
    }

    fn connection_type(&self) -> ConnectionType {
        if self.anonymize() {
            ConnectionType::AnonymizedRelay
        } else {
            ConnectionType::Direct
        }
    }

    fn hello(&self) -> Message {
        let running = self.running.lock();
        Message::Hello {
            peer_id: self.config.node_id,
            listen_port: running.as_ref().map_or(self.config.listen_port, |r| r.local_addr.port()),
            anonymous: running.as_ref().is_some_and(|r| r.anonymize),
        }
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, NetworkError> {
        if self.anonymize() {
            return socks::connect(&self.config.socks_proxy, addr, self.config.connect_timeout).await;
        }
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::Connection(ConnectionError::Timeout))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn note_announce(&self, hash: ContentHash, peer: PeerId) {
        let mut entry = self.announcers.entry(hash).or_default();
        if !entry.contains(&peer) {
            entry.push(peer);
        }
    }

    /// Linked peers sorted by id, so cursors stay meaningful between calls.
    fn sorted_links(&self) -> Vec<(PeerId, String)> {
        let mut links: Vec<(PeerId, String)> = self
            .links
            .iter()
            .map(|e| (*e.key(), e.value().address.clone()))
            .collect();
        links.sort_by_key(|(id, _)| *id);
        links
    }

    /// Where to ask for `hash`: the preferred peer, then peers that
    /// announced it, then everyone else.
    fn content_sources(&self, preferred: Option<PeerId>, hash: &ContentHash) -> Vec<(PeerId, String)> {
        let links = self.sorted_links();
        let announced: Vec<PeerId> = self
            .announcers
            .get(hash)
            .map(|a| a.value().clone())
            .unwrap_or_default();

        let mut order: Vec<PeerId> = preferred.into_iter().collect();
        order.extend(announced);
        order.extend(links.iter().map(|(id, _)| *id));

        let mut seen = BTreeSet::new();
        order
            .into_iter()
            .filter(|id| seen.insert(*id))
            .filter_map(|id| {
                links
                    .iter()
                    .find(|(l, _)| *l == id)
                    .map(|(_, addr)| (id, addr.clone()))
            })
            .collect()
    }

    async fn request_content(
        &self,
        peer: PeerId,
        addr: &str,
        hash: ContentHash,
    ) -> Result<ContentStream, NetworkError> {
        let mut stream = self.dial(addr).await?;
        write_message(&mut stream, &Message::Want { hash }).await?;
        let size = match read_message(&mut stream).await? {
            Message::Have { size, .. } => size,
            Message::NotFound { .. } => return Err(NetworkError::NotFound),
            Message::Error { message } => return Err(NetworkError::Protocol(message)),
            other => {
                return Err(NetworkError::Protocol(format!(
                    "unexpected reply to want: {:?}",
                    other.kind()
                )))
            }
        };

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(frames::pump_data(stream, tx));
        Ok(ContentStream {
            peer: Some(peer),
            size_hint: Some(size),
            reader: Box::new(ChannelReader::new(rx)),
        })
    }

    async fn request(&self, addr: &str, msg: &Message) -> Result<Message, NetworkError> {
        let mut stream = self.dial(addr).await?;
        write_message(&mut stream, msg).await?;
        tokio::time::timeout(self.config.connect_timeout, read_message(&mut stream))
            .await
            .map_err(|_| NetworkError::Connection(ConnectionError::Timeout))?
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown.send_replace(true);
        for task in &running.tasks {
            task.abort();
        }
        let peers: Vec<PeerId> = self.links.iter().map(|e| *e.key()).collect();
        self.links.clear();
        for peer in peers {
            let _ = running.events.send((peer, PeerEvent::Disconnected));
        }
        for task in running.tasks {
            let _ = task.await;
        }
        tracing::info!("overlay stopped");
    }
}

/// Cursor across peers: `"{peer index}/{remote cursor}"`.
fn parse_cursor(cursor: Option<&str>) -> Result<(usize, Option<String>), NetworkError> {
    let Some(cursor) = cursor else {
        return Ok((0, None));
    };
    let (index, remote) = cursor
        .split_once('/')
        .ok_or_else(|| NetworkError::Protocol(format!("bad cursor {cursor}")))?;
    let index = index
        .parse()
        .map_err(|_| NetworkError::Protocol(format!("bad cursor {cursor}")))?;
    let remote = (!remote.is_empty()).then(|| remote.to_string());
    Ok((index, remote))
}

impl Transport for OverlayTransport {
    fn bring_up(&self, anonymize: bool, events: PeerEventSink) -> BoxFuture<'_, Result<(), NetworkError>> {
        Box::pin(async move {
            let inner = &self.inner;
            inner.stop().await;

            if anonymize {
                socks::probe(&inner.config.socks_proxy, inner.config.connect_timeout).await?;
                tracing::debug!(proxy = %inner.config.socks_proxy, "anonymizing proxy reachable");
            }

            let bind = format!("{}:{}", inner.config.listen_addr, inner.config.listen_port);
            let listener = TcpListener::bind(&bind).await?;
            let local_addr = listener.local_addr()?;
            let (shutdown, shutdown_rx) = watch::channel(false);

            *inner.running.lock() = Some(Running {
                events,
                anonymize,
                local_addr,
                shutdown,
                tasks: Vec::new(),
            });

            let mut tasks = vec![tokio::spawn(server::accept_loop(
                self.inner.clone(),
                listener,
                shutdown_rx.clone(),
            ))];
            for addr in &inner.config.bootstrap_peers {
                tasks.push(tokio::spawn(link::maintain(
                    self.inner.clone(),
                    addr.clone(),
                    shutdown_rx.clone(),
                )));
            }
            if let Some(running) = inner.running.lock().as_mut() {
                running.tasks = tasks;
            }

            tracing::info!(
                addr = %local_addr,
                anonymize,
                bootstrap_peers = inner.config.bootstrap_peers.len(),
                "overlay up"
            );
            Ok(())
        })
    }

    fn tear_down(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.inner.stop())
    }

    fn announce(&self, hash: ContentHash, size: u64) -> BoxFuture<'_, Result<(), NetworkError>> {
        Box::pin(async move {
            let frame = wire::encode_message(&Message::Announce { hash, size }).map_err(frames::protocol)?;
            let mut reached = 0;
            for link in self.inner.links.iter() {
                if link.outbound.send(frame.clone()).is_ok() {
                    reached += 1;
                }
            }
            tracing::debug!(hash = %hash.short(), size, reached, "content announced");
            Ok(())
        })
    }

    fn open_content(
        &self,
        peer: Option<PeerId>,
        hash: ContentHash,
    ) -> BoxFuture<'_, Result<ContentStream, NetworkError>> {
        Box::pin(async move {
            let sources = self.inner.content_sources(peer, &hash);
            if sources.is_empty() {
                return Err(NetworkError::Connection(ConnectionError::PeerUnreachable));
            }
            let mut last = NetworkError::NotFound;
            for (peer, addr) in sources {
                match self.inner.request_content(peer, &addr, hash).await {
                    Ok(stream) => return Ok(stream),
                    Err(NetworkError::NotFound) => {}
                    Err(e) => {
                        tracing::debug!(peer = %peer.short(), error = %e, "content request failed");
                        last = e;
                    }
                }
            }
            Err(last)
        })
    }

    fn query_communities<'a>(
        &'a self,
        query: &'a DiscoveryQuery,
        cursor: Option<String>,
        page_size: usize,
    ) -> BoxFuture<'a, Result<DiscoveryPage, NetworkError>> {
        Box::pin(async move {
            let peers = self.inner.sorted_links();
            let (index, remote) = parse_cursor(cursor.as_deref())?;
            let Some((peer, addr)) = peers.get(index) else {
                return Ok(DiscoveryPage::default());
            };

            let request = Message::Query {
                query: query.clone(),
                cursor: remote,
                page_size,
            };
            let page = match self.inner.request(addr, &request).await? {
                Message::Page(page) => page,
                Message::Error { message } => return Err(NetworkError::Protocol(message)),
                other => {
                    return Err(NetworkError::Protocol(format!(
                        "unexpected reply to query: {:?}",
                        other.kind()
                    )))
                }
            };

            let results = page
                .results
                .into_iter()
                .map(|mut r| {
                    r.host.get_or_insert(*peer);
                    r
                })
                .collect();
            let next_cursor = match page.next_cursor {
                Some(c) => Some(format!("{index}/{c}")),
                None if index + 1 < peers.len() => Some(format!("{}/", index + 1)),
                None => None,
            };
            Ok(DiscoveryPage {
                results,
                next_cursor,
            })
        })
    }

    fn join_community<'a>(
        &'a self,
        request: &'a JoinRequest,
    ) -> BoxFuture<'a, Result<CommunityEngagementSettings, NetworkError>> {
        Box::pin(async move {
            let mut last = NetworkError::NotFound;
            for (peer, addr) in self.inner.sorted_links() {
                match self.inner.request(&addr, &Message::Join(request.clone())).await {
                    Ok(Message::Joined(settings)) => return Ok(settings),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(peer = %peer.short(), error = %e, "join request failed");
                        last = e;
                    }
                }
            }
            Err(last)
        })
    }
}

/// Forward served bytes to whoever accounts uploads.
fn record_upload(inner: &Inner, bytes: u64) {
    if bytes > 0 {
        let _ = inner.uploads.send(bytes);
    }
}

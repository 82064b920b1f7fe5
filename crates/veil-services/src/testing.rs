//! Scriptable in-process transport for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::AsyncRead;

use veil_core::{
    CommunityDiscoveryResult, CommunityEngagementSettings, ConnectionError, ContentHash,
    DiscoveryPage, DiscoveryQuery, JoinRequest, NetworkError, PeerId,
};

use crate::transport::{ContentStream, PeerEvent, PeerEventSink, Transport};

#[derive(Default)]
pub struct FakeTransport {
    bring_ups: AtomicUsize,
    tear_downs: AtomicUsize,
    failing_bring_ups: AtomicUsize,
    bring_up_delay: Mutex<Duration>,
    opens: AtomicUsize,
    transient_opens: AtomicUsize,
    open_delay: Mutex<Duration>,
    content: Mutex<HashMap<ContentHash, Vec<u8>>>,
    streams: Mutex<HashMap<ContentHash, Box<dyn AsyncRead + Send + Unpin>>>,
    announced: Mutex<Vec<ContentHash>>,
    announce_delay: Mutex<Duration>,
    refused: Mutex<HashSet<ContentHash>>,
    communities: Mutex<Vec<CommunityDiscoveryResult>>,
    queries: AtomicUsize,
    joins: AtomicUsize,
    join_delay: Mutex<Duration>,
    events: Mutex<Option<PeerEventSink>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bring_up_delay(&self, delay: Duration) {
        *self.bring_up_delay.lock() = delay;
    }

    pub fn fail_next_bring_ups(&self, n: usize) {
        self.failing_bring_ups.store(n, Ordering::SeqCst);
    }

    pub fn bring_ups(&self) -> usize {
        self.bring_ups.load(Ordering::SeqCst)
    }

    pub fn tear_downs(&self) -> usize {
        self.tear_downs.load(Ordering::SeqCst)
    }

    /// Serve `bytes` under their own hash.
    pub fn serve(&self, bytes: &[u8]) -> ContentHash {
        let hash = ContentHash::of(bytes);
        self.content.lock().insert(hash, bytes.to_vec());
        hash
    }

    /// Serve arbitrary bytes under `hash`, e.g. to simulate corruption.
    pub fn serve_as(&self, hash: ContentHash, bytes: &[u8]) {
        self.content.lock().insert(hash, bytes.to_vec());
    }

    /// The next open of `hash` reads from `reader` instead of stored bytes.
    pub fn serve_stream(&self, hash: ContentHash, reader: impl AsyncRead + Send + Unpin + 'static) {
        self.streams.lock().insert(hash, Box::new(reader));
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.transient_opens.store(n, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn announced(&self) -> Vec<ContentHash> {
        self.announced.lock().clone()
    }

    pub fn set_announce_delay(&self, delay: Duration) {
        *self.announce_delay.lock() = delay;
    }

    /// Every announce of `hash` fails permanently.
    pub fn refuse_announce(&self, hash: ContentHash) {
        self.refused.lock().insert(hash);
    }

    pub fn set_join_delay(&self, delay: Duration) {
        *self.join_delay.lock() = delay;
    }

    pub fn host(&self, community: CommunityDiscoveryResult) {
        self.communities.lock().push(community);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    /// Push a connection event through the sink handed over on bring-up.
    pub fn emit(&self, peer: PeerId, event: PeerEvent) -> bool {
        match self.events.lock().as_ref() {
            Some(sink) => sink.send((peer, event)).is_ok(),
            None => false,
        }
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transport for FakeTransport {
    fn bring_up(&self, _anonymize: bool, events: PeerEventSink) -> BoxFuture<'_, Result<(), NetworkError>> {
        Box::pin(async move {
            self.bring_ups.fetch_add(1, Ordering::SeqCst);
            *self.events.lock() = Some(events);
            let delay = *self.bring_up_delay.lock();
            tokio::time::sleep(delay).await;
            if Self::take_one(&self.failing_bring_ups) {
                return Err(NetworkError::Connection(ConnectionError::PeerUnreachable));
            }
            Ok(())
        })
    }

    fn tear_down(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.tear_downs.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn announce(&self, hash: ContentHash, _size: u64) -> BoxFuture<'_, Result<(), NetworkError>> {
        Box::pin(async move {
            let delay = *self.announce_delay.lock();
            tokio::time::sleep(delay).await;
            if self.refused.lock().contains(&hash) {
                return Err(NetworkError::Protocol("announce refused".into()));
            }
            self.announced.lock().push(hash);
            Ok(())
        })
    }

    fn open_content(
        &self,
        peer: Option<PeerId>,
        hash: ContentHash,
    ) -> BoxFuture<'_, Result<ContentStream, NetworkError>> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let delay = *self.open_delay.lock();
            tokio::time::sleep(delay).await;
            if Self::take_one(&self.transient_opens) {
                return Err(NetworkError::Connection(ConnectionError::Timeout));
            }
            if let Some(reader) = self.streams.lock().remove(&hash) {
                return Ok(ContentStream {
                    peer,
                    size_hint: None,
                    reader,
                });
            }
            let bytes = self
                .content
                .lock()
                .get(&hash)
                .cloned()
                .ok_or(NetworkError::NotFound)?;
            Ok(ContentStream {
                peer,
                size_hint: Some(bytes.len() as u64),
                reader: Box::new(std::io::Cursor::new(bytes)),
            })
        })
    }

    fn query_communities<'a>(
        &'a self,
        query: &'a DiscoveryQuery,
        cursor: Option<String>,
        page_size: usize,
    ) -> BoxFuture<'a, Result<DiscoveryPage, NetworkError>> {
        Box::pin(async move {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let start: usize = match cursor {
                Some(c) => c
                    .parse()
                    .map_err(|_| NetworkError::Protocol(format!("bad cursor {c}")))?,
                None => 0,
            };
            let matching: Vec<_> = self
                .communities
                .lock()
                .iter()
                .filter(|c| c.matches(query))
                .cloned()
                .collect();
            let end = (start + page_size.max(1)).min(matching.len());
            let results = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
            Ok(DiscoveryPage {
                results,
                next_cursor: (end < matching.len()).then(|| end.to_string()),
            })
        })
    }

    fn join_community<'a>(
        &'a self,
        request: &'a JoinRequest,
    ) -> BoxFuture<'a, Result<CommunityEngagementSettings, NetworkError>> {
        Box::pin(async move {
            self.joins.fetch_add(1, Ordering::SeqCst);
            let delay = *self.join_delay.lock();
            tokio::time::sleep(delay).await;
            let known = self
                .communities
                .lock()
                .iter()
                .any(|c| c.community_id == request.community_id);
            if !known {
                return Err(NetworkError::NotFound);
            }
            Ok(CommunityEngagementSettings {
                community_id: request.community_id.clone(),
                identity: request.identity.clone(),
                display_name: request.display_name.clone(),
                joined_at: SystemTime::now(),
                notify_on_activity: true,
                auto_fetch: false,
            })
        })
    }
}

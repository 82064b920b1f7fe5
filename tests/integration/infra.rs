//! In-process overlay: every node's transport sees every other node that is
//! up, serves content straight from that node's store, and answers
//! community queries from the communities it hosts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use veil_core::{
    CommunityDiscoveryResult, CommunityEngagementSettings, ConnectionError, ConnectionType,
    ContentHash, DiscoveryPage, DiscoveryQuery, JoinRequest, NetworkError, PeerId,
};
use veil_services::{ContentStore, ContentStream, PeerEvent, PeerEventSink, Transport};

struct Attached {
    events: PeerEventSink,
    anonymize: bool,
    store: ContentStore,
    hosted: Vec<CommunityDiscoveryResult>,
}

#[derive(Default)]
pub struct Mesh {
    nodes: Mutex<BTreeMap<PeerId, Attached>>,
    members: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl Mesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn up_count(&self) -> usize {
        self.nodes.lock().len()
    }
}

fn address(peer: &PeerId) -> String {
    format!("mesh://{}", peer.short())
}

fn introduce(sink: &PeerEventSink, peer: PeerId, anonymous: bool) {
    let events = [
        PeerEvent::Discovered {
            address: address(&peer),
            connection_type: if anonymous {
                ConnectionType::AnonymizedRelay
            } else {
                ConnectionType::Direct
            },
            is_anonymous: anonymous,
        },
        PeerEvent::Connecting,
        PeerEvent::Connected,
    ];
    for event in events {
        let _ = sink.send((peer, event));
    }
}

pub struct MeshTransport {
    pub id: PeerId,
    mesh: Arc<Mesh>,
    store: ContentStore,
    hosted: Mutex<Vec<CommunityDiscoveryResult>>,
    reachable: AtomicBool,
    bring_ups: AtomicUsize,
}

impl MeshTransport {
    pub fn new(mesh: Arc<Mesh>, store: ContentStore) -> Self {
        Self {
            id: PeerId::random(),
            mesh,
            store,
            hosted: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            bring_ups: AtomicUsize::new(0),
        }
    }

    /// Host a community; takes effect on the next bring-up.
    pub fn host(&self, id: &str, name: &str, tags: &[&str]) {
        self.hosted.lock().push(CommunityDiscoveryResult {
            community_id: id.into(),
            name: name.to_string(),
            description: format!("{name} community"),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            member_count: 0,
            host: None,
        });
    }

    /// While unreachable, every bring-up fails as a transient error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn bring_ups(&self) -> usize {
        self.bring_ups.load(Ordering::SeqCst)
    }

    /// Drop every link to `peer` from both sides, as if the route died.
    pub fn sever(&self, peer: PeerId, error: ConnectionError) {
        let nodes = self.mesh.nodes.lock();
        if let Some(me) = nodes.get(&self.id) {
            let _ = me.events.send((peer, PeerEvent::Failed(error.clone())));
        }
        if let Some(other) = nodes.get(&peer) {
            let _ = other.events.send((self.id, PeerEvent::Failed(error)));
        }
    }
}

impl Transport for MeshTransport {
    fn bring_up(&self, anonymize: bool, events: PeerEventSink) -> BoxFuture<'_, Result<(), NetworkError>> {
        Box::pin(async move {
            self.bring_ups.fetch_add(1, Ordering::SeqCst);
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(NetworkError::Connection(ConnectionError::PeerUnreachable));
            }

            let mut nodes = self.mesh.nodes.lock();
            nodes.remove(&self.id);
            for (peer, other) in nodes.iter() {
                introduce(&events, *peer, other.anonymize);
                introduce(&other.events, self.id, anonymize);
            }
            let hosted = self
                .hosted
                .lock()
                .iter()
                .cloned()
                .map(|mut c| {
                    c.host = Some(self.id);
                    c
                })
                .collect();
            nodes.insert(
                self.id,
                Attached {
                    events,
                    anonymize,
                    store: self.store.clone(),
                    hosted,
                },
            );
            Ok(())
        })
    }

    fn tear_down(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut nodes = self.mesh.nodes.lock();
            if let Some(me) = nodes.remove(&self.id) {
                for (peer, other) in nodes.iter() {
                    let _ = other.events.send((self.id, PeerEvent::Disconnected));
                    let _ = me.events.send((*peer, PeerEvent::Disconnected));
                }
            }
        })
    }

    fn announce(&self, _hash: ContentHash, _size: u64) -> BoxFuture<'_, Result<(), NetworkError>> {
        Box::pin(async move {
            if self.mesh.nodes.lock().contains_key(&self.id) {
                Ok(())
            } else {
                Err(NetworkError::Connection(ConnectionError::PeerUnreachable))
            }
        })
    }

    fn open_content(
        &self,
        peer: Option<PeerId>,
        hash: ContentHash,
    ) -> BoxFuture<'_, Result<ContentStream, NetworkError>> {
        Box::pin(async move {
            let sources: Vec<(PeerId, ContentStore)> = {
                let nodes = self.mesh.nodes.lock();
                let mut order: Vec<PeerId> = peer.into_iter().collect();
                order.extend(nodes.keys().copied());
                let mut seen = BTreeSet::new();
                order
                    .into_iter()
                    .filter(|id| *id != self.id && seen.insert(*id))
                    .filter_map(|id| nodes.get(&id).map(|n| (id, n.store.clone())))
                    .collect()
            };
            if sources.is_empty() {
                return Err(NetworkError::Connection(ConnectionError::PeerUnreachable));
            }
            for (id, store) in sources {
                if let Some((file, size)) = store.open(&hash).await? {
                    return Ok(ContentStream {
                        peer: Some(id),
                        size_hint: Some(size),
                        reader: Box::new(file),
                    });
                }
            }
            Err(NetworkError::NotFound)
        })
    }

    fn query_communities<'a>(
        &'a self,
        query: &'a DiscoveryQuery,
        cursor: Option<String>,
        page_size: usize,
    ) -> BoxFuture<'a, Result<DiscoveryPage, NetworkError>> {
        Box::pin(async move {
            let start: usize = match cursor {
                Some(c) => c
                    .parse()
                    .map_err(|_| NetworkError::Protocol(format!("bad cursor {c}")))?,
                None => 0,
            };
            let members = self.mesh.members.lock().clone();
            let matching: Vec<CommunityDiscoveryResult> = self
                .mesh
                .nodes
                .lock()
                .iter()
                .filter(|(id, _)| **id != self.id)
                .flat_map(|(_, n)| n.hosted.iter().cloned())
                .map(|mut c| {
                    c.member_count = members.get(&c.community_id.0).map_or(0, |m| m.len() as u64);
                    c
                })
                .filter(|c| c.matches(query))
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
            let hosted = self
                .mesh
                .nodes
                .lock()
                .values()
                .any(|n| n.hosted.iter().any(|c| c.community_id == request.community_id));
            if !hosted {
                return Err(NetworkError::NotFound);
            }
            self.mesh
                .members
                .lock()
                .entry(request.community_id.0.clone())
                .or_default()
                .insert(request.identity.clone());
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

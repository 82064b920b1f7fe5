//! Peer connection registry: the single source of truth for peer state.
//!
//! Every mutation goes through `upsert`, which validates the transition and
//! applies it while holding the peer's shard lock, so readers never observe
//! a half-applied change. Bus notifications are published after the lock is
//! released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

use veil_core::{ConnectionState, ConnectionType, PeerId, PeerInfo, RegistryError};

use crate::bus::{EventBus, SessionEvent};
use crate::transport::PeerEvent;

#[derive(Debug, Clone)]
struct Entry {
    info: PeerInfo,
    /// Discovery order; stable across reconnects.
    seq: u64,
}

/// Optional predicate for `list`.
#[derive(Debug, Clone, Default)]
pub struct PeerFilter {
    pub state: Option<ConnectionState>,
    pub connection_type: Option<ConnectionType>,
    pub anonymous_only: bool,
}

impl PeerFilter {
    pub fn state(state: ConnectionState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    fn accepts(&self, info: &PeerInfo) -> bool {
        self.state.map_or(true, |s| info.state == s)
            && self.connection_type.map_or(true, |t| info.connection_type == t)
            && (!self.anonymous_only || info.is_anonymous)
    }
}

/// Next state for `event` in `from`, `Ok(None)` for a refresh without a
/// state change.
fn transition(
    from: ConnectionState,
    event: &PeerEvent,
) -> Result<Option<ConnectionState>, &'static str> {
    use ConnectionState::*;
    let to = match event {
        PeerEvent::Discovered { .. } | PeerEvent::Heartbeat => return Ok(None),
        PeerEvent::Connecting => Connecting,
        PeerEvent::Connected => Connected,
        PeerEvent::Disconnected => Disconnected,
        PeerEvent::Failed(_) => Error,
    };
    if to == from {
        return Ok(None);
    }
    let allowed = matches!(
        (from, to),
        (Discovered, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connecting, Error)
            | (Connected, Disconnected)
            | (Connected, Error)
            | (Disconnected, Connecting)
            | (Error, Connecting)
    );
    if allowed {
        Ok(Some(to))
    } else {
        Err(event.name())
    }
}

#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<DashMap<PeerId, Entry>>,
    next_seq: Arc<AtomicU64>,
    version: Arc<AtomicU64>,
    last_connected_at: Arc<Mutex<Option<SystemTime>>>,
    bus: EventBus<SessionEvent>,
}

impl PeerRegistry {
    pub fn new(bus: EventBus<SessionEvent>) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
            version: Arc::new(AtomicU64::new(0)),
            last_connected_at: Arc::new(Mutex::new(None)),
            bus,
        }
    }

    /// Apply one transport event. Unknown peers are created only by
    /// `Discovered`; an invalid transition leaves the peer untouched.
    pub fn upsert(&self, peer: PeerId, event: PeerEvent) -> Result<PeerInfo, RegistryError> {
        let now = SystemTime::now();

        let (info, change) = match self.peers.entry(peer) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let PeerEvent::Discovered {
                    address,
                    connection_type,
                    is_anonymous,
                } = event
                else {
                    return Err(RegistryError::UnknownPeer(peer));
                };
                let info = PeerInfo {
                    peer_id: peer,
                    address,
                    state: ConnectionState::Discovered,
                    last_seen: now,
                    connection_type,
                    is_anonymous,
                };
                slot.insert(Entry {
                    info: info.clone(),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                });
                self.version.fetch_add(1, Ordering::SeqCst);
                (info, Some((None, ConnectionState::Discovered)))
            }
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let from = entry.info.state;
                let next = transition(from, &event).map_err(|name| {
                    RegistryError::InvalidTransition {
                        peer,
                        from,
                        event: name,
                    }
                })?;

                if let PeerEvent::Discovered {
                    address,
                    connection_type,
                    is_anonymous,
                } = event
                {
                    entry.info.address = address;
                    entry.info.connection_type = connection_type;
                    entry.info.is_anonymous = is_anonymous;
                }
                entry.info.last_seen = now;
                if let Some(to) = next {
                    entry.info.state = to;
                    if to == ConnectionState::Connected {
                        *self.last_connected_at.lock() = Some(now);
                    }
                    self.version.fetch_add(1, Ordering::SeqCst);
                }
                (entry.info.clone(), next.map(|to| (Some(from), to)))
            }
        };

        if let Some((from, to)) = change {
            tracing::debug!(peer = %peer.short(), ?from, ?to, "peer state changed");
            self.bus.publish(&SessionEvent::PeerChanged { peer, from, to });
        }
        Ok(info)
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers.get(peer).map(|e| e.info.clone())
    }

    /// Snapshot of matching peers in discovery order.
    pub fn list(&self, filter: Option<&PeerFilter>) -> Vec<PeerInfo> {
        let mut entries: Vec<(u64, PeerInfo)> = self
            .peers
            .iter()
            .filter(|e| filter.map_or(true, |f| f.accepts(&e.info)))
            .map(|e| (e.seq, e.info.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    pub fn count_in(&self, state: ConnectionState) -> usize {
        self.peers.iter().filter(|e| e.info.state == state).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Bumped on every state change, insertion, or removal.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn last_connected_at(&self) -> Option<SystemTime> {
        *self.last_connected_at.lock()
    }

    /// Connected peers in the order a fetch should try them: direct links
    /// first, then anonymized relays, then plain relays; most recently seen
    /// first within a class.
    pub fn fetch_candidates(&self) -> Vec<PeerId> {
        let mut connected = self.list(Some(&PeerFilter::state(ConnectionState::Connected)));
        connected.sort_by(|a, b| {
            a.connection_type
                .preference()
                .cmp(&b.connection_type.preference())
                .then(b.last_seen.cmp(&a.last_seen))
        });
        connected.into_iter().map(|p| p.peer_id).collect()
    }

    /// Evict peers not heard from within `threshold` that are not Connected.
    /// Returns the evicted ids.
    pub fn sweep_stale(&self, now: SystemTime, threshold: Duration) -> Vec<PeerId> {
        let mut evicted = Vec::new();
        self.peers.retain(|id, entry| {
            let age = now
                .duration_since(entry.info.last_seen)
                .unwrap_or(Duration::ZERO);
            let stale = entry.info.state != ConnectionState::Connected && age > threshold;
            if stale {
                evicted.push(*id);
            }
            !stale
        });

        if !evicted.is_empty() {
            self.version.fetch_add(1, Ordering::SeqCst);
            tracing::info!(count = evicted.len(), "evicted stale peers");
            for peer in &evicted {
                self.bus.publish(&SessionEvent::PeerRemoved(*peer));
            }
        }
        evicted
    }

    /// Background sweep until `shutdown` flips to true.
    pub async fn sweep_loop(
        self,
        interval: Duration,
        threshold: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_stale(SystemTime::now(), threshold);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("stale peer sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::ConnectionError;

    fn discovered(kind: ConnectionType) -> PeerEvent {
        PeerEvent::Discovered {
            address: "10.0.0.1:7420".into(),
            connection_type: kind,
            is_anonymous: kind == ConnectionType::AnonymizedRelay,
        }
    }

    fn connect(reg: &PeerRegistry, peer: PeerId, kind: ConnectionType) {
        reg.upsert(peer, discovered(kind)).unwrap();
        reg.upsert(peer, PeerEvent::Connecting).unwrap();
        reg.upsert(peer, PeerEvent::Connected).unwrap();
    }

    #[test]
    fn full_lifecycle_with_reconnect() {
        let reg = PeerRegistry::new(EventBus::new());
        let p = PeerId::random();

        assert_eq!(
            reg.upsert(p, discovered(ConnectionType::Direct)).unwrap().state,
            ConnectionState::Discovered
        );
        connect(&reg, p, ConnectionType::Direct);
        assert_eq!(reg.get(&p).unwrap().state, ConnectionState::Connected);
        assert!(reg.last_connected_at().is_some());

        reg.upsert(p, PeerEvent::Failed(ConnectionError::Timeout)).unwrap();
        assert_eq!(reg.get(&p).unwrap().state, ConnectionState::Error);

        reg.upsert(p, PeerEvent::Connecting).unwrap();
        reg.upsert(p, PeerEvent::Disconnected).unwrap();
        assert_eq!(reg.get(&p).unwrap().state, ConnectionState::Disconnected);
    }

    #[test]
    fn invalid_transition_leaves_state_untouched() {
        let reg = PeerRegistry::new(EventBus::new());
        let p = PeerId::random();
        reg.upsert(p, discovered(ConnectionType::Relay)).unwrap();

        let err = reg.upsert(p, PeerEvent::Connected).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidTransition {
                peer: p,
                from: ConnectionState::Discovered,
                event: "connected",
            }
        );
        assert_eq!(reg.get(&p).unwrap().state, ConnectionState::Discovered);
    }

    #[test]
    fn unknown_peer_needs_discovery_first() {
        let reg = PeerRegistry::new(EventBus::new());
        let p = PeerId::random();
        assert_eq!(
            reg.upsert(p, PeerEvent::Connecting).unwrap_err(),
            RegistryError::UnknownPeer(p)
        );
        assert!(reg.is_empty());
    }

    #[test]
    fn heartbeat_refreshes_without_state_change() {
        let bus = EventBus::new();
        let reg = PeerRegistry::new(bus.clone());
        let p = PeerId::random();
        connect(&reg, p, ConnectionType::Direct);
        let before = reg.version();
        let seen_before = reg.get(&p).unwrap().last_seen;

        std::thread::sleep(Duration::from_millis(2));
        reg.upsert(p, PeerEvent::Heartbeat).unwrap();
        reg.upsert(p, PeerEvent::Connected).unwrap();

        assert_eq!(reg.version(), before);
        assert!(reg.get(&p).unwrap().last_seen > seen_before);
    }

    #[test]
    fn list_keeps_discovery_order_and_filters() {
        let reg = PeerRegistry::new(EventBus::new());
        let ids: Vec<PeerId> = (0..5).map(|_| PeerId::random()).collect();
        for id in &ids {
            reg.upsert(*id, discovered(ConnectionType::Direct)).unwrap();
        }
        connect(&reg, ids[3], ConnectionType::Direct);

        let all: Vec<PeerId> = reg.list(None).into_iter().map(|p| p.peer_id).collect();
        assert_eq!(all, ids);

        let connected = reg.list(Some(&PeerFilter::state(ConnectionState::Connected)));
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].peer_id, ids[3]);
        assert_eq!(reg.count_in(ConnectionState::Discovered), 4);
    }

    #[test]
    fn sweep_spares_connected_peers() {
        let bus = EventBus::new();
        let reg = PeerRegistry::new(bus.clone());
        let removed = Arc::new(Mutex::new(Vec::new()));
        let r = removed.clone();
        let _sub = bus.subscribe(move |e: &SessionEvent| {
            if let SessionEvent::PeerRemoved(p) = e {
                r.lock().push(*p);
            }
        });

        let live = PeerId::random();
        let idle = PeerId::random();
        connect(&reg, live, ConnectionType::Direct);
        reg.upsert(idle, discovered(ConnectionType::Relay)).unwrap();

        let later = SystemTime::now() + Duration::from_secs(600);
        let evicted = reg.sweep_stale(later, Duration::from_secs(300));

        assert_eq!(evicted, vec![idle]);
        assert_eq!(*removed.lock(), vec![idle]);
        assert!(reg.get(&live).is_some());
        assert!(reg.get(&idle).is_none());
    }

    #[test]
    fn candidates_prefer_direct_links() {
        let reg = PeerRegistry::new(EventBus::new());
        let relay = PeerId::random();
        let anon = PeerId::random();
        let direct = PeerId::random();
        connect(&reg, relay, ConnectionType::Relay);
        connect(&reg, anon, ConnectionType::AnonymizedRelay);
        connect(&reg, direct, ConnectionType::Direct);
        reg.upsert(PeerId::random(), discovered(ConnectionType::Direct)).unwrap();

        assert_eq!(reg.fetch_candidates(), vec![direct, anon, relay]);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_stops_on_shutdown() {
        let reg = PeerRegistry::new(EventBus::new());
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(reg.clone().sweep_loop(
            Duration::from_secs(1),
            Duration::from_secs(60),
            rx,
        ));
        tokio::time::sleep(Duration::from_secs(3)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}

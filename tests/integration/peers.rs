use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use veil_core::{ConnectionError, ConnectionState, ConnectionType, HealthStatus};
use veil_services::{PeerFilter, SessionEvent};

use crate::*;

#[tokio::test]
async fn registry_tracks_the_whole_mesh() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    let b = Node::new(&mesh);
    let c = Node::new(&mesh);
    enable_all(&[&a, &b, &c]).await;

    wait_until(Duration::from_secs(2), "full mesh", || {
        [&a, &b, &c]
            .iter()
            .all(|n| n.session.registry.count_in(ConnectionState::Connected) == 2)
    })
    .await
    .unwrap();

    let peers = a.session.registry.list(None);
    assert_eq!(peers.len(), 2);
    assert!(peers.iter().all(|p| p.peer_id != a.id));
    assert!(peers.iter().all(|p| p.address.starts_with("mesh://")));
    // Every node runs anonymized by default.
    assert!(peers.iter().all(|p| p.is_anonymous));
    assert!(peers
        .iter()
        .all(|p| p.connection_type == ConnectionType::AnonymizedRelay));

    let filter = PeerFilter {
        connection_type: Some(ConnectionType::Direct),
        ..PeerFilter::default()
    };
    assert!(a.session.registry.list(Some(&filter)).is_empty());

    for n in [&a, &b, &c] {
        n.stop().await;
    }
}

#[tokio::test]
async fn failed_link_moves_peer_to_error_and_health_follows() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    let b = Node::new(&mesh);
    enable_all(&[&a, &b]).await;
    wait_until(Duration::from_secs(2), "link", || {
        a.session.health.snapshot().status == HealthStatus::Connected
    })
    .await
    .unwrap();

    let changes = Arc::new(AtomicUsize::new(0));
    let seen = changes.clone();
    let _sub = a.session.health.subscribe(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    a.transport.sever(b.id, ConnectionError::Timeout);
    wait_until(Duration::from_secs(2), "error state", || {
        a.session
            .registry
            .get(&b.id)
            .is_some_and(|p| p.state == ConnectionState::Error)
    })
    .await
    .unwrap();

    let health = a.session.health.snapshot();
    assert_eq!(health.connected_peer_count, 0);
    assert_eq!(health.status, HealthStatus::Disconnected);
    // The bootstrap itself is fine; only the link died.
    assert!(health.error_message.is_none());
    assert!(changes.load(Ordering::SeqCst) >= 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn peer_changes_are_published_on_the_bus() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    let b = Node::new(&mesh);
    let (mut rx, _sub) = a.session.bus.subscribe_channel();

    enable_all(&[&a, &b]).await;

    let mut states = Vec::new();
    let collect = async {
        while let Some(event) = rx.recv().await {
            if let SessionEvent::PeerChanged { peer, to, .. } = event {
                assert_eq!(peer, b.id);
                states.push(to);
                if to == ConnectionState::Connected {
                    break;
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(2), collect)
        .await
        .unwrap();
    assert_eq!(
        states,
        vec![
            ConnectionState::Discovered,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );

    a.stop().await;
    b.stop().await;
}

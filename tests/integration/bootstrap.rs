use std::time::Duration;

use veil_core::{BootstrapError, HealthStatus};
use veil_services::BootstrapPhase;

use crate::*;

#[tokio::test]
async fn enabling_two_nodes_connects_them() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    let b = Node::new(&mesh);
    enable_all(&[&a, &b]).await;

    wait_until(Duration::from_secs(2), "both sides connected", || {
        a.session.health.snapshot().connected_peer_count == 1
            && b.session.health.snapshot().connected_peer_count == 1
    })
    .await
    .unwrap();

    let health = a.session.health.snapshot();
    assert_eq!(health.status, HealthStatus::Connected);
    assert!(health.anonymizing_transport_enabled);
    assert!(health.last_connected_at.is_some());
    assert_eq!(a.session.bootstrap.phase(), BootstrapPhase::Enabled);
    assert_eq!(a.session.bootstrap.tries(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn concurrent_enables_share_one_bring_up() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);

    let (r1, r2, r3) = tokio::join!(
        a.session.bootstrap.enable(),
        a.session.bootstrap.enable(),
        a.session.bootstrap.enable(),
    );
    assert!(r1.is_ok() && r2.is_ok() && r3.is_ok());
    assert_eq!(a.transport.bring_ups(), 1);

    // Already enabled: no new attempt.
    a.session.bootstrap.enable().await.unwrap();
    assert_eq!(a.transport.bring_ups(), 1);
    a.stop().await;
}

#[tokio::test]
async fn unreachable_transport_fails_after_retries() {
    let mesh = Mesh::new();
    let a = Node::build(&mesh, Default::default(), |t| t.set_reachable(false));

    let err = a.session.bootstrap.enable().await.unwrap_err();
    assert!(matches!(err, BootstrapError::TransportUnavailable(_)));
    assert_eq!(a.transport.bring_ups(), 3);
    assert!(matches!(a.session.bootstrap.phase(), BootstrapPhase::Failed(_)));
    assert!(!a.session.bootstrap.is_enabled());

    let health = a.session.health.snapshot();
    assert_eq!(health.status, HealthStatus::Error);
    assert!(health.error_message.is_some());

    // The route comes back; a fresh enable starts over.
    a.transport.set_reachable(true);
    a.session.bootstrap.enable().await.unwrap();
    assert_eq!(a.session.bootstrap.phase(), BootstrapPhase::Enabled);
    assert!(a.session.bootstrap.last_error().is_none());
    a.stop().await;
}

#[tokio::test]
async fn disabling_one_node_disconnects_it_everywhere() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    let b = Node::new(&mesh);
    enable_all(&[&a, &b]).await;
    wait_until(Duration::from_secs(2), "link", || {
        a.session.health.snapshot().connected_peer_count == 1
    })
    .await
    .unwrap();

    b.session.bootstrap.disable().await;
    assert_eq!(mesh.up_count(), 1);
    wait_until(Duration::from_secs(2), "a to notice", || {
        a.session.health.snapshot().status == HealthStatus::Disconnected
    })
    .await
    .unwrap();
    assert_eq!(b.session.bootstrap.phase(), BootstrapPhase::Disabled);

    // Disable is idempotent.
    b.session.bootstrap.disable().await;
    assert_eq!(b.session.bootstrap.phase(), BootstrapPhase::Disabled);

    b.session.bootstrap.enable().await.unwrap();
    wait_until(Duration::from_secs(2), "reconnect", || {
        a.session.health.snapshot().connected_peer_count == 1
    })
    .await
    .unwrap();

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn caller_deadline_does_not_cancel_the_shared_attempt() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);

    let result = a
        .session
        .bootstrap
        .enable_with_deadline(Some(Duration::ZERO))
        .await;
    // Either the attempt already finished or this caller gave up.
    if let Err(e) = result {
        assert_eq!(e, BootstrapError::Timeout);
    }
    a.session.bootstrap.enable().await.unwrap();
    assert!(a.session.bootstrap.is_enabled());
    assert_eq!(a.transport.bring_ups(), 1);
    a.stop().await;
}

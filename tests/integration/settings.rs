use std::sync::Arc;
use std::time::Duration;

use veil_core::PersistenceError;
use veil_services::settings::{STORAGE_FOLDER, TRANSPORT_ANONYMIZE};
use veil_services::{KeyValueBackend, MemoryBackend, SessionEvent};

use crate::*;

#[tokio::test]
async fn saved_anonymize_choice_applies_at_start() {
    let mesh = Mesh::new();
    let backend = Arc::new(MemoryBackend::new());
    backend.write(TRANSPORT_ANONYMIZE, "false").unwrap();

    let a = Node::build(&mesh, backend, |_| {});
    assert!(!a.session.bootstrap.anonymize());

    a.session.bootstrap.enable().await.unwrap();
    assert!(!a.session.health.snapshot().anonymizing_transport_enabled);
    a.stop().await;
}

#[tokio::test]
async fn changing_anonymize_reaches_bootstrap() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    assert!(a.session.bootstrap.anonymize());

    a.session.settings.set(TRANSPORT_ANONYMIZE, "false").unwrap();
    wait_until(Duration::from_secs(2), "anonymize off", || {
        !a.session.bootstrap.anonymize()
    })
    .await
    .unwrap();
    assert_eq!(
        a.backend.read(TRANSPORT_ANONYMIZE).unwrap().as_deref(),
        Some("false")
    );
    a.stop().await;
}

#[tokio::test]
async fn unreachable_backend_degrades_but_keeps_values() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    let (mut rx, _sub) = a.session.bus.subscribe_channel();

    a.backend.set_unreachable(true);
    let err = a.session.settings.set(STORAGE_FOLDER, "/srv/veil").unwrap_err();
    assert!(matches!(err, PersistenceError::WriteFailed { .. }));
    assert!(a.session.settings.is_degraded());
    assert_eq!(
        a.session.settings.get(STORAGE_FOLDER).as_deref(),
        Some("/srv/veil")
    );

    let mut saw_change = false;
    let mut saw_failure = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::SettingChanged { key, .. } if key == STORAGE_FOLDER => saw_change = true,
            SessionEvent::PersistenceFailed(_) => saw_failure = true,
            _ => {}
        }
    }
    assert!(saw_change && saw_failure);

    let health = a.session.health.snapshot();
    assert!(health.error_message.is_none());
    a.stop().await;
}

#[tokio::test]
async fn unreadable_backend_at_start_is_degraded() {
    let mesh = Mesh::new();
    let backend = Arc::new(MemoryBackend::new());
    backend.set_unreachable(true);
    let a = Node::build(&mesh, backend, |_| {});

    assert!(a.session.settings.is_degraded());
    assert!(a.session.settings.all().is_empty());
    // Defaults still apply.
    assert!(a.session.bootstrap.anonymize());
    a.stop().await;
}

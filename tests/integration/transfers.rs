use std::time::Duration;

use veil_core::{ContentHash, TransferDirection, TransferError, TransferState};

use crate::*;

async fn linked_pair(mesh: &std::sync::Arc<Mesh>) -> (Node, Node) {
    let a = Node::new(mesh);
    let b = Node::new(mesh);
    enable_all(&[&a, &b]).await;
    wait_until(Duration::from_secs(2), "link", || {
        a.session.health.snapshot().connected_peer_count == 1
            && b.session.health.snapshot().connected_peer_count == 1
    })
    .await
    .unwrap();
    (a, b)
}

#[tokio::test]
async fn published_file_is_fetched_and_verified() {
    let mesh = Mesh::new();
    let (a, b) = linked_pair(&mesh).await;

    let bytes = payload(300_000, 7);
    let src = a.write_file("album.flac", &bytes);
    let hash = a.session.transfers.publish(&src).await.unwrap();
    assert_eq!(hash, ContentHash::of(&bytes));
    assert!(a.session.transfers.store().has(&hash));

    let dest = b.path("downloads/album.flac");
    b.session.transfers.fetch(hash, &dest).await.unwrap();
    assert_eq!(read(&dest), bytes);
    assert!(b.session.transfers.store().has(&hash));
    assert_eq!(b.session.transfers.bytes_received(), bytes.len() as u64);

    let history = b.session.transfers.history();
    let op = history
        .iter()
        .find(|op| op.hash == hash && op.direction == TransferDirection::Fetch)
        .unwrap();
    assert_eq!(op.state, TransferState::Completed);
    assert_eq!(op.peer, Some(a.id));
    assert_eq!(op.bytes_transferred, bytes.len() as u64);

    let metrics = b.session.health.metrics();
    assert_eq!(metrics.bytes_received, bytes.len() as u64);
    assert!(metrics.success_rate > 0.99);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn second_fetch_is_served_locally() {
    let mesh = Mesh::new();
    let (a, b) = linked_pair(&mesh).await;

    let src = a.write_file("notes.txt", b"field notes");
    let hash = a.session.transfers.publish(&src).await.unwrap();
    b.session.transfers.fetch(hash, b.path("one.txt")).await.unwrap();

    // The origin goes away; the copy in b's store still serves.
    a.session.bootstrap.disable().await;
    b.session
        .transfers
        .fetch(hash, b.path("two.txt"))
        .await
        .unwrap();
    assert_eq!(read(&b.path("two.txt")), b"field notes");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn concurrent_fetches_of_one_hash_share_an_operation() {
    let mesh = Mesh::new();
    let (a, b) = linked_pair(&mesh).await;

    let bytes = payload(1_000_000, 3);
    let hash = a
        .session
        .transfers
        .publish(a.write_file("big.bin", &bytes))
        .await
        .unwrap();

    let first = b.path("x/big.bin");
    let second = b.path("y/big.bin");
    let (r1, r2) = tokio::join!(
        b.session.transfers.fetch(hash, &first),
        b.session.transfers.fetch(hash, &second),
    );
    r1.unwrap();
    r2.unwrap();
    assert_eq!(read(&first), bytes);
    assert_eq!(read(&second), bytes);

    let fetches = b
        .session
        .transfers
        .history()
        .into_iter()
        .filter(|op| op.hash == hash && op.direction == TransferDirection::Fetch)
        .count();
    assert_eq!(fetches, 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn missing_content_is_not_found() {
    let mesh = Mesh::new();
    let (a, b) = linked_pair(&mesh).await;

    let err = b
        .session
        .transfers
        .fetch(ContentHash::of(b"nobody has this"), b.path("missing"))
        .await
        .unwrap_err();
    assert_eq!(err, TransferError::NotFound);
    assert!(!b.path("missing").exists());

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn transfers_need_an_enabled_transport() {
    let mesh = Mesh::new();
    let a = Node::new(&mesh);
    let src = a.write_file("draft.txt", b"draft");

    assert_eq!(
        a.session.transfers.publish(&src).await.unwrap_err(),
        TransferError::TransportUnavailable
    );
    assert_eq!(
        a.session
            .transfers
            .fetch(ContentHash::of(b"draft"), a.path("out"))
            .await
            .unwrap_err(),
        TransferError::TransportUnavailable
    );
    a.stop().await;
}

#[tokio::test]
async fn seeding_publishes_each_file_independently() {
    let mesh = Mesh::new();
    let (a, b) = linked_pair(&mesh).await;

    a.write_file("one.txt", b"one");
    a.write_file("two.txt", b"two");
    std::fs::create_dir_all(a.dir.join("files").join("nested")).unwrap();

    let results = a
        .session
        .transfers
        .seed_folder(a.dir.join("files"))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.result.is_ok()));

    let hash = ContentHash::of(b"two");
    b.session.transfers.fetch(hash, b.path("two.txt")).await.unwrap();
    assert_eq!(read(&b.path("two.txt")), b"two");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn stopping_a_session_gates_new_transfers() {
    let mesh = Mesh::new();
    let (a, b) = linked_pair(&mesh).await;

    b.stop().await;
    assert!(!b.session.bootstrap.is_enabled());
    assert_eq!(
        b.session
            .transfers
            .fetch(ContentHash::of(b"late"), b.path("late"))
            .await
            .unwrap_err(),
        TransferError::TransportUnavailable
    );
    assert_eq!(mesh.up_count(), 1);
    a.stop().await;
}

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};

use veil_core::{CommunityId, DirectoryError, DiscoveryQuery, JoinRequest};

use crate::*;

fn join_request(community: &str, identity: &str) -> JoinRequest {
    JoinRequest {
        community_id: CommunityId::from(community),
        identity: identity.to_string(),
        display_name: Some("River".to_string()),
    }
}

async fn host_and_seeker(mesh: &std::sync::Arc<Mesh>) -> (Node, Node) {
    let host = Node::build(mesh, Default::default(), |t| {
        t.host("folk", "Folk Archive", &["music", "archive"]);
        t.host("jazz", "Jazz Club", &["music"]);
        t.host("birds", "Bird Calls", &["nature"]);
    });
    let seeker = Node::new(mesh);
    enable_all(&[&host, &seeker]).await;
    (host, seeker)
}

#[tokio::test]
async fn discovery_pages_through_every_match() {
    let mesh = Mesh::new();
    let (host, seeker) = host_and_seeker(&mesh).await;

    // Page size is 2, so three results span two pages.
    let all = seeker
        .session
        .directory
        .discover_all(DiscoveryQuery::default(), None)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.iter().all(|c| c.host == Some(host.id)));

    let music = seeker
        .session
        .directory
        .discover_all(
            DiscoveryQuery {
                text: String::new(),
                tags: vec!["MUSIC".into()],
            },
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    let mut names: Vec<_> = music.iter().map(|c| c.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["Folk Archive", "Jazz Club"]);

    // The stream is lazy: taking one result needs one page.
    let first: Vec<_> = seeker
        .session
        .directory
        .discover(DiscoveryQuery::text("bird"), None)
        .unwrap()
        .take(1)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(first[0].community_id, CommunityId::from("birds"));

    host.stop().await;
    seeker.stop().await;
}

#[tokio::test]
async fn joining_is_idempotent_and_persisted() {
    let mesh = Mesh::new();
    let (host, seeker) = host_and_seeker(&mesh).await;

    let joined = seeker
        .session
        .directory
        .join(join_request("folk", "river"))
        .await
        .unwrap();
    assert_eq!(joined.identity, "river");
    assert!(joined.notify_on_activity);

    let again = seeker
        .session
        .directory
        .join(join_request("folk", "river"))
        .await
        .unwrap();
    assert_eq!(again.joined_at, joined.joined_at);

    let folk = seeker
        .session
        .directory
        .discover_all(DiscoveryQuery::text("folk"), None)
        .await
        .unwrap();
    assert_eq!(folk[0].member_count, 1);

    // A fresh session over the same backend sees the membership.
    seeker.stop().await;
    let restarted = Node::build(&mesh, seeker.backend.clone(), |_| {});
    let memberships = restarted.session.directory.memberships();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].community_id, CommunityId::from("folk"));

    assert!(restarted
        .session
        .directory
        .leave("river", &CommunityId::from("folk")));
    assert!(!restarted
        .session
        .directory
        .leave("river", &CommunityId::from("folk")));
    assert!(restarted.session.directory.memberships().is_empty());

    host.stop().await;
    restarted.stop().await;
}

#[tokio::test]
async fn unknown_community_and_disabled_transport_fail() {
    let mesh = Mesh::new();
    let (host, seeker) = host_and_seeker(&mesh).await;

    let err = seeker
        .session
        .directory
        .join(join_request("opera", "river"))
        .await
        .unwrap_err();
    assert!(matches!(err, DirectoryError::QueryFailed(_)));
    assert!(seeker.session.directory.memberships().is_empty());

    seeker.session.bootstrap.disable().await;
    assert!(matches!(
        seeker.session.directory.discover(DiscoveryQuery::default(), None),
        Err(DirectoryError::TransportUnavailable)
    ));
    assert_eq!(
        seeker
            .session
            .directory
            .join(join_request("folk", "river"))
            .await
            .unwrap_err(),
        DirectoryError::TransportUnavailable
    );

    host.stop().await;
    seeker.stop().await;
}

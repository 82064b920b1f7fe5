//! Long-lived peer links: handshake, heartbeat, and reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use veil_core::wire::{self, Message};
use veil_core::{ConnectionError, NetworkError, PeerId};
use veil_services::{Backoff, PeerEvent};

use super::frames::{read_message, write_message};
use super::{Inner, Link};

/// Why a link loop returned.
enum LinkEnd {
    Shutdown,
    Lost(NetworkError),
}

const DUPLICATE_LINK: &str = "duplicate link";
const SELF_LINK: &str = "cannot link to self";

/// Keep a link to one configured bootstrap address alive until shutdown.
pub async fn maintain(inner: Arc<Inner>, addr: String, mut shutdown: watch::Receiver<bool>) {
    let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60)).with_jitter();
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let known = inner.known.get(&addr).map(|e| *e.value());
        if let Some(peer) = known {
            inner.emit(peer, PeerEvent::Connecting);
        }

        match dial_link(&inner, &addr).await {
            Ok((stream, peer, anonymous)) => {
                attempt = 0;
                inner.known.insert(addr.clone(), peer);
                inner.emit(
                    peer,
                    PeerEvent::Discovered {
                        address: addr.clone(),
                        connection_type: inner.connection_type(),
                        is_anonymous: anonymous,
                    },
                );
                if known.is_none() {
                    inner.emit(peer, PeerEvent::Connecting);
                }
                match run_link(&inner, stream, peer, addr.clone(), shutdown.clone()).await {
                    LinkEnd::Shutdown => return,
                    LinkEnd::Lost(e) => {
                        tracing::info!(peer = %peer.short(), %addr, error = %e, "link lost");
                        inner.emit(peer, lost_event(&e));
                    }
                }
            }
            Err(NetworkError::Protocol(reason)) => {
                tracing::info!(%addr, %reason, "not linking to bootstrap peer");
                if let Some(peer) = known {
                    inner.emit(peer, PeerEvent::Disconnected);
                }
                return;
            }
            Err(e) => {
                tracing::debug!(%addr, error = %e, attempt, "bootstrap peer unreachable");
                if let Some(peer) = known {
                    inner.emit(peer, lost_event(&e));
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff.delay(attempt)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Outbound handshake: send our Hello, expect theirs.
async fn dial_link(inner: &Inner, addr: &str) -> Result<(TcpStream, PeerId, bool), NetworkError> {
    let mut stream = inner.dial(addr).await?;
    write_message(&mut stream, &inner.hello()).await?;
    let reply = tokio::time::timeout(inner.config.connect_timeout, read_message(&mut stream))
        .await
        .map_err(|_| NetworkError::Connection(ConnectionError::Timeout))??;
    match reply {
        Message::Hello { peer_id, .. } if peer_id == inner.config.node_id => {
            Err(NetworkError::Protocol(SELF_LINK.to_string()))
        }
        Message::Hello {
            peer_id, anonymous, ..
        } => Ok((stream, peer_id, anonymous || inner.anonymize())),
        Message::Error { message } => Err(NetworkError::Protocol(message)),
        other => Err(NetworkError::Protocol(format!(
            "unexpected handshake reply: {:?}",
            other.kind()
        ))),
    }
}

/// Inbound handshake, after the remote's Hello has been read.
pub async fn accept_link(
    inner: Arc<Inner>,
    mut stream: TcpStream,
    address: String,
    peer: PeerId,
    anonymous: bool,
    shutdown: watch::Receiver<bool>,
) {
    let refusal = if peer == inner.config.node_id {
        Some(SELF_LINK)
    } else if inner.links.contains_key(&peer) {
        Some(DUPLICATE_LINK)
    } else {
        None
    };
    if let Some(message) = refusal {
        let _ = write_message(&mut stream, &Message::Error { message: message.to_string() }).await;
        return;
    }
    if let Err(e) = write_message(&mut stream, &inner.hello()).await {
        tracing::debug!(peer = %peer.short(), error = %e, "handshake reply failed");
        return;
    }

    inner.emit(
        peer,
        PeerEvent::Discovered {
            address: address.clone(),
            connection_type: inner.connection_type(),
            is_anonymous: anonymous || inner.anonymize(),
        },
    );
    inner.emit(peer, PeerEvent::Connecting);
    if let LinkEnd::Lost(e) = run_link(&inner, stream, peer, address, shutdown).await {
        tracing::info!(peer = %peer.short(), error = %e, "inbound link lost");
        inner.emit(peer, lost_event(&e));
    }
}

/// Clean closes read as Disconnected; connection faults as Failed.
fn lost_event(e: &NetworkError) -> PeerEvent {
    match e {
        NetworkError::Connection(c) => PeerEvent::Failed(c.clone()),
        _ => PeerEvent::Disconnected,
    }
}

/// Run an established link until it drops or the overlay shuts down.
async fn run_link(
    inner: &Arc<Inner>,
    stream: TcpStream,
    peer: PeerId,
    address: String,
    mut shutdown: watch::Receiver<bool>,
) -> LinkEnd {
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    inner.links.insert(
        peer,
        Link {
            address,
            outbound: outbound.clone(),
        },
    );
    inner.emit(peer, PeerEvent::Connected);
    tracing::info!(peer = %peer.short(), "link up");

    // Frame reads are not cancel-safe, so they run on their own task.
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        loop {
            let msg = read_message(&mut reader).await;
            let stop = msg.is_err();
            if inbound_tx.send(msg).is_err() || stop {
                return;
            }
        }
    });

    let heartbeat = wire::encode_message(&Message::Heartbeat);
    let mut ticker = tokio::time::interval(inner.config.heartbeat);
    ticker.tick().await;
    let dead_after = inner.config.heartbeat * 3;
    let idle = tokio::time::sleep(dead_after);
    tokio::pin!(idle);

    let end = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break LinkEnd::Shutdown;
                }
            }
            _ = ticker.tick() => {
                if let Ok(frame) = &heartbeat {
                    let _ = outbound.send(frame.clone());
                }
            }
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = writer.write_all(&frame).await {
                    break LinkEnd::Lost(e.into());
                }
            }
            () = &mut idle => {
                break LinkEnd::Lost(NetworkError::Connection(ConnectionError::Timeout));
            }
            msg = inbound.recv() => {
                idle.as_mut().reset(Instant::now() + dead_after);
                match msg {
                    Some(Ok(Message::Heartbeat)) => inner.emit(peer, PeerEvent::Heartbeat),
                    Some(Ok(Message::Announce { hash, size })) => {
                        tracing::trace!(peer = %peer.short(), hash = %hash.short(), size, "peer announced content");
                        inner.note_announce(hash, peer);
                        inner.emit(peer, PeerEvent::Heartbeat);
                    }
                    Some(Ok(other)) => {
                        tracing::trace!(peer = %peer.short(), kind = ?other.kind(), "ignoring frame on link");
                    }
                    Some(Err(e)) => break LinkEnd::Lost(e),
                    None => break LinkEnd::Lost(NetworkError::Io("link reader stopped".to_string())),
                }
            }
        }
    };

    reader_task.abort();
    inner
        .links
        .remove_if(&peer, |_, link| link.outbound.same_channel(&outbound));
    end
}

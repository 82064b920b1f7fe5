//! Inbound connections: link handshakes and one-shot requests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use veil_core::wire::Message;
use veil_core::{
    CommunityEngagementSettings, ContentHash, DiscoveryPage, DiscoveryQuery, JoinRequest,
    NetworkError,
};

use super::frames::{read_message, write_data, write_message};
use super::{link, record_upload, Inner};

const CHUNK_SIZE: usize = 64 * 1024;
const MAX_PAGE: usize = 100;

pub async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(handle_connection(inner.clone(), stream, remote, shutdown.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn handle_connection(
    inner: Arc<Inner>,
    mut stream: TcpStream,
    remote: SocketAddr,
    shutdown: watch::Receiver<bool>,
) {
    let first = match tokio::time::timeout(inner.config.connect_timeout, read_message(&mut stream)).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            tracing::debug!(%remote, error = %e, "dropping connection");
            return;
        }
        Err(_) => {
            tracing::debug!(%remote, "no request before timeout");
            return;
        }
    };

    let result = match first {
        Message::Hello {
            peer_id,
            listen_port,
            anonymous,
        } => {
            let address = SocketAddr::new(remote.ip(), listen_port).to_string();
            link::accept_link(inner, stream, address, peer_id, anonymous, shutdown).await;
            return;
        }
        Message::Want { hash } => serve_content(&inner, &mut stream, hash).await,
        Message::Query {
            query,
            cursor,
            page_size,
        } => {
            let reply = match answer_query(&inner, &query, cursor.as_deref(), page_size) {
                Ok(page) => Message::Page(page),
                Err(message) => Message::Error { message },
            };
            write_message(&mut stream, &reply).await
        }
        Message::Join(request) => {
            let reply = match answer_join(&inner, &request) {
                Some(settings) => Message::Joined(settings),
                None => Message::Error {
                    message: format!("community {} is not hosted here", request.community_id),
                },
            };
            write_message(&mut stream, &reply).await
        }
        other => {
            let reply = Message::Error {
                message: format!("unexpected request {:?}", other.kind()),
            };
            write_message(&mut stream, &reply).await
        }
    };

    if let Err(e) = result {
        tracing::debug!(%remote, error = %e, "request failed");
    }
    let _ = stream.shutdown().await;
}

async fn serve_content(inner: &Inner, stream: &mut TcpStream, hash: ContentHash) -> Result<(), NetworkError> {
    let Some((mut file, size)) = inner.store.open(&hash).await? else {
        return write_message(stream, &Message::NotFound { hash }).await;
    };
    write_message(stream, &Message::Have { hash, size }).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        write_data(stream, &buf[..n]).await?;
        sent += n as u64;
    }
    write_message(stream, &Message::End { hash }).await?;
    tracing::debug!(hash = %hash.short(), bytes = sent, "content served");
    record_upload(inner, sent);
    Ok(())
}

/// Page through hosted communities. The cursor is the index of the next result.
fn answer_query(
    inner: &Inner,
    query: &DiscoveryQuery,
    cursor: Option<&str>,
    page_size: usize,
) -> Result<DiscoveryPage, String> {
    let start = match cursor {
        Some(c) => c.parse::<usize>().map_err(|_| format!("bad cursor {c}"))?,
        None => 0,
    };
    let page_size = page_size.clamp(1, MAX_PAGE);

    let matching: Vec<_> = inner
        .config
        .hosted
        .iter()
        .map(|c| {
            let members = inner.members.get(&c.id).map_or(0, |m| m.len() as u64);
            let mut result = c.to_result(members);
            result.host = Some(inner.config.node_id);
            result
        })
        .filter(|r| r.matches(query))
        .collect();

    let end = (start + page_size).min(matching.len());
    let results = matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
    let next_cursor = (end < matching.len()).then(|| end.to_string());
    Ok(DiscoveryPage {
        results,
        next_cursor,
    })
}

fn answer_join(inner: &Inner, request: &JoinRequest) -> Option<CommunityEngagementSettings> {
    inner
        .config
        .hosted
        .iter()
        .find(|c| c.id == request.community_id.0)?;
    inner
        .members
        .entry(request.community_id.0.clone())
        .or_default()
        .insert(request.identity.clone());
    tracing::info!(community = %request.community_id, identity = %request.identity, "member joined");
    Some(CommunityEngagementSettings {
        community_id: request.community_id.clone(),
        identity: request.identity.clone(),
        display_name: request.display_name.clone(),
        joined_at: SystemTime::now(),
        notify_on_activity: true,
        auto_fetch: false,
    })
}

//! Minimal SOCKS5 client (RFC 1928, no authentication, CONNECT only).
//! Used to route overlay traffic through the anonymizing proxy.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use veil_core::{ConnectionError, NetworkError};

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Open a TCP stream to `target` (host:port) through the proxy at `proxy`.
pub async fn connect(proxy: &str, target: &str, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let (host, port) = split_target(target)?;
    let attempt = async {
        let mut stream = TcpStream::connect(proxy).await?;
        greet(&mut stream).await?;
        request_connect(&mut stream, host, port).await?;
        Ok::<_, NetworkError>(stream)
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| NetworkError::Connection(ConnectionError::Timeout))?
}

/// Check that the proxy is up and speaks SOCKS5.
pub async fn probe(proxy: &str, timeout: Duration) -> Result<(), NetworkError> {
    let attempt = async {
        let mut stream = TcpStream::connect(proxy).await?;
        greet(&mut stream).await
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| NetworkError::Connection(ConnectionError::Timeout))?
}

fn split_target(target: &str) -> Result<(&str, u16), NetworkError> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| NetworkError::Protocol(format!("target {target} has no port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port
        .parse()
        .map_err(|_| NetworkError::Protocol(format!("target {target} has a bad port")))?;
    if host.is_empty() || host.len() > 255 {
        return Err(NetworkError::Protocol(format!("target {target} has a bad host")));
    }
    Ok((host, port))
}

async fn greet<S>(io: &mut S) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    io.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut reply = [0u8; 2];
    io.read_exact(&mut reply).await?;
    if reply != [VERSION, NO_AUTH] {
        return Err(NetworkError::Protocol(format!(
            "proxy refused no-auth greeting: {:02x?}",
            reply
        )));
    }
    Ok(())
}

async fn request_connect<S>(io: &mut S, host: &str, port: u16) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8]);
    req.extend_from_slice(host.as_bytes());
    req.extend_from_slice(&port.to_be_bytes());
    io.write_all(&req).await?;

    let mut head = [0u8; 4];
    io.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(NetworkError::Protocol("proxy sent a bad reply version".to_string()));
    }
    if head[1] != 0x00 {
        return Err(reply_error(head[1]));
    }

    // Skip the bound address, then the port.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => io.read_u8().await? as usize,
        other => {
            return Err(NetworkError::Protocol(format!(
                "proxy sent unknown address type {other}"
            )))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    io.read_exact(&mut rest).await?;
    Ok(())
}

fn reply_error(code: u8) -> NetworkError {
    match code {
        0x03 | 0x04 => NetworkError::Connection(ConnectionError::PeerUnreachable),
        0x05 => NetworkError::Connection(ConnectionError::Refused),
        0x06 => NetworkError::Connection(ConnectionError::Timeout),
        other => NetworkError::Protocol(format!("proxy connect failed with code {other}")),
    }
}

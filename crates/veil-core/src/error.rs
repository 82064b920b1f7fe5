//! Error taxonomy for the session core.
//!
//! Transient failures (timeouts, unreachable peers) are retried inside the
//! component that owns the operation. What reaches a caller is either a
//! permanent failure or a transient one whose retry budget ran out.
//! Errors that fan out to several observers of one operation are `Clone`,
//! so I/O failures are carried as rendered strings.

use crate::hash::ContentHash;
use crate::types::{ConnectionState, PeerId};

/// Failure establishing or keeping a connection to one peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("peer unreachable")]
    PeerUnreachable,
}

/// Failure reported by an injected transport capability.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("content not found on the overlay")]
    NotFound,
    #[error("i/o error: {0}")]
    Io(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl NetworkError {
    /// Worth another attempt with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetworkError::Connection(_) | NetworkError::Io(_))
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => NetworkError::Connection(ConnectionError::Timeout),
            ErrorKind::ConnectionRefused => NetworkError::Connection(ConnectionError::Refused),
            ErrorKind::NotConnected | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                NetworkError::Connection(ConnectionError::PeerUnreachable)
            }
            _ => NetworkError::Io(e.to_string()),
        }
    }
}

/// Bringing the anonymizing transport and overlay online failed.
///
/// A concurrent `enable()` while an attempt is in flight is not an error:
/// the caller attaches to the running attempt and shares its outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap timed out")]
    Timeout,
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transport unavailable: bootstrap is not enabled")]
    TransportUnavailable,
    #[error("content not found")]
    NotFound,
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
    #[error("i/o failure: {0}")]
    IoFailure(String),
    #[error("transfer timed out")]
    TimedOut,
    #[error("transfer cancelled")]
    Cancelled,
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::IoFailure(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("transport unavailable: bootstrap is not enabled")]
    TransportUnavailable,
    #[error("community query failed: {0}")]
    QueryFailed(String),
    #[error("community request timed out")]
    TimedOut,
}

/// Durable store could not be reached. Never fatal: the local cache stays
/// authoritative and the failure is reported as an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to write setting {key}: {reason}")]
    WriteFailed { key: String, reason: String },
    #[error("failed to read setting {key}: {reason}")]
    ReadFailed { key: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {peer}: {event} is not valid in state {from:?}")]
    InvalidTransition {
        peer: PeerId,
        from: ConnectionState,
        event: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(NetworkError::Connection(ConnectionError::Timeout).is_transient());
        assert!(NetworkError::Connection(ConnectionError::PeerUnreachable).is_transient());
        assert!(NetworkError::Io("reset".into()).is_transient());
        assert!(!NetworkError::NotFound.is_transient());
        assert!(!NetworkError::Protocol("bad frame".into()).is_transient());
    }

    #[test]
    fn io_error_kinds_map_to_connection_errors() {
        let e: NetworkError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert_eq!(e, NetworkError::Connection(ConnectionError::Timeout));
        let e: NetworkError = std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert_eq!(e, NetworkError::Connection(ConnectionError::Refused));
    }
}

//! Veil overlay wire format.
//!
//! Every message on an overlay stream is a fixed 12-byte `FrameHeader`
//! followed by `length` payload bytes. Control frames carry JSON payloads;
//! `Data` frames carry raw content bytes. Changing anything here is a
//! breaking protocol change.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::hash::ContentHash;
use crate::types::{
    CommunityEngagementSettings, DiscoveryPage, DiscoveryQuery, JoinRequest, PeerId,
};

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Precedes every frame on an overlay stream.
///
/// Wire size: 12 bytes. Multi-byte fields are big-endian.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Always `FRAME_MAGIC`.
    pub magic: [u8; 4],
    /// Currently `FRAME_VERSION`.
    pub version: u8,
    /// One of `FrameKind`.
    pub kind: u8,
    /// Reserved, must be zero.
    pub flags: U16<NetworkEndian>,
    /// Payload length in bytes, not including this header.
    pub length: U32<NetworkEndian>,
}

assert_eq_size!(FrameHeader, [u8; 12]);

pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();
pub const FRAME_MAGIC: [u8; 4] = *b"VEIL";
pub const FRAME_VERSION: u8 = 0x01;

/// Largest payload accepted in one frame.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

impl FrameHeader {
    pub fn new(kind: FrameKind, length: usize) -> Result<Self, WireError> {
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok(Self {
            magic: FRAME_MAGIC,
            version: FRAME_VERSION,
            kind: kind.into(),
            flags: U16::new(0),
            length: U32::new(length as u32),
        })
    }

    /// Parse and validate a header. Returns the kind and payload length.
    pub fn parse(bytes: &[u8]) -> Result<(FrameKind, usize), WireError> {
        let header = FrameHeader::read_from_prefix(bytes).ok_or(WireError::Truncated)?;
        if header.magic != FRAME_MAGIC {
            return Err(WireError::BadMagic);
        }
        if header.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.flags.get() != 0 {
            return Err(WireError::ReservedFlagsSet(header.flags.get()));
        }
        let length = header.length.get() as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok((FrameKind::try_from(header.kind)?, length))
    }
}

/// Serialize one complete frame.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header = FrameHeader::new(kind, payload.len())?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Serialize a control message as a JSON frame of its own kind.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(msg).map_err(|e| WireError::Malformed(e.to_string()))?;
    encode_frame(msg.kind(), &payload)
}

pub fn decode_message(payload: &[u8]) -> Result<Message, WireError> {
    serde_json::from_slice(payload).map_err(|e| WireError::Malformed(e.to_string()))
}

// ── Frame kinds ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Hello = 0x01,
    Heartbeat = 0x02,
    Announce = 0x03,
    Want = 0x10,
    Have = 0x11,
    Data = 0x12,
    End = 0x13,
    NotFound = 0x14,
    Query = 0x20,
    Page = 0x21,
    Join = 0x22,
    Joined = 0x23,
    Error = 0x7f,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0x01 => FrameKind::Hello,
            0x02 => FrameKind::Heartbeat,
            0x03 => FrameKind::Announce,
            0x10 => FrameKind::Want,
            0x11 => FrameKind::Have,
            0x12 => FrameKind::Data,
            0x13 => FrameKind::End,
            0x14 => FrameKind::NotFound,
            0x20 => FrameKind::Query,
            0x21 => FrameKind::Page,
            0x22 => FrameKind::Join,
            0x23 => FrameKind::Joined,
            0x7f => FrameKind::Error,
            other => return Err(WireError::UnknownKind(other)),
        })
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Control messages ──────────────────────────────────────────────────────────

/// JSON body of every non-`Data` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Hello {
        peer_id: PeerId,
        listen_port: u16,
        anonymous: bool,
    },
    Heartbeat,
    Announce {
        hash: ContentHash,
        size: u64,
    },
    Want {
        hash: ContentHash,
    },
    Have {
        hash: ContentHash,
        size: u64,
    },
    End {
        hash: ContentHash,
    },
    NotFound {
        hash: ContentHash,
    },
    Query {
        query: DiscoveryQuery,
        cursor: Option<String>,
        page_size: usize,
    },
    Page(DiscoveryPage),
    Join(JoinRequest),
    Joined(CommunityEngagementSettings),
    Error {
        message: String,
    },
}

impl Message {
    pub fn kind(&self) -> FrameKind {
        match self {
            Message::Hello { .. } => FrameKind::Hello,
            Message::Heartbeat => FrameKind::Heartbeat,
            Message::Announce { .. } => FrameKind::Announce,
            Message::Want { .. } => FrameKind::Want,
            Message::Have { .. } => FrameKind::Have,
            Message::End { .. } => FrameKind::End,
            Message::NotFound { .. } => FrameKind::NotFound,
            Message::Query { .. } => FrameKind::Query,
            Message::Page(_) => FrameKind::Page,
            Message::Join(_) => FrameKind::Join,
            Message::Joined(_) => FrameKind::Joined,
            Message::Error { .. } => FrameKind::Error,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated")]
    Truncated,
    #[error("bad frame magic")]
    BadMagic,
    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),
    #[error("reserved flags are non-zero: 0x{0:04x}")]
    ReservedFlagsSet(u16),
    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),
    #[error("malformed control message: {0}")]
    Malformed(String),
}

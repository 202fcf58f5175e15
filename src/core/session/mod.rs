//! Shared transfer-session vocabulary: identifiers, directions, terminal
//! reasons, and chunk splitting.

use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod receiver;
pub mod sender;

pub use receiver::ReceiverSession;
pub use sender::SenderSession;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Opaque stable identifier of a mesh peer, as reported by the device
/// (Meshtastic node ids look like `!a1b2c3d4`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Token scoping one file transfer across all of its control and data
/// frames. Chosen by the sender; 8 random lowercase-hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(String);

/// Minimum accepted length for a transfer id on the wire.
pub const TRANSFER_ID_MIN: usize = 6;
/// Maximum accepted length for a transfer id on the wire.
pub const TRANSFER_ID_MAX: usize = 16;

impl TransferId {
    /// Generate a fresh random transfer id.
    pub fn generate() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..8].to_string())
    }

    /// Validate a transfer id received on the wire: printable ASCII,
    /// pipe-free, within the accepted length range.
    pub fn parse(s: &str) -> Option<Self> {
        let ok_len = (TRANSFER_ID_MIN..=TRANSFER_ID_MAX).contains(&s.len());
        let ok_chars = s.bytes().all(|b| b.is_ascii_graphic() && b != b'|');
        if ok_len && ok_chars {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TransferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Direction / terminal reasons ─────────────────────────────────────────────

/// Which side of a transfer a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// Reason carried by an ABT frame. Wire tokens are short, fixed, and
/// forward-compatible: unknown tokens parse as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A session for this peer already exists.
    Busy,
    /// Semantically invalid frame (bad index, oversized payload).
    Protocol,
    /// Receiver saw no activity for the idle window.
    IdleTimeout,
    /// Engine is shutting down.
    Shutdown,
    /// Operator cancelled the transfer.
    User,
    /// Unrecognized reason token from a peer.
    Other(String),
}

impl AbortReason {
    pub fn token(&self) -> &str {
        match self {
            AbortReason::Busy => "busy",
            AbortReason::Protocol => "protocol",
            AbortReason::IdleTimeout => "idle",
            AbortReason::Shutdown => "shutdown",
            AbortReason::User => "user",
            AbortReason::Other(s) => s,
        }
    }

    pub fn from_token(s: &str) -> Self {
        match s {
            "busy" => AbortReason::Busy,
            "protocol" => AbortReason::Protocol,
            "idle" => AbortReason::IdleTimeout,
            "shutdown" => AbortReason::Shutdown,
            "user" => AbortReason::User,
            other => AbortReason::Other(other.to_string()),
        }
    }
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Why a `start` request was refused before any frame went out.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StartError {
    /// An active session in this direction already exists for the peer.
    #[error("a transfer with this peer is already active")]
    PeerBusy,
    /// The chunk rules cannot represent a zero-byte file.
    #[error("cannot transfer an empty file")]
    EmptyFile,
    /// More chunks than a 16-bit index can address.
    #[error("file needs {chunks} chunks, limit is {}", u16::MAX)]
    TooLarge { chunks: usize },
}

/// Why a transfer ended without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// BEGIN went unanswered through all retries.
    NoResponse,
    /// A single chunk exhausted its retry budget.
    ChunkExhausted(u16),
    /// END was sent (and retried) but no FIN ever arrived.
    FinalTimeout,
    /// The receiver reported FIN(err).
    ReceiverError,
    /// Receiver-side idle window expired.
    IdleTimeout,
    /// The file sink could not persist the reassembled bytes.
    SinkError,
    /// The peer (or local operator / shutdown) aborted the transfer.
    Aborted(AbortReason),
    /// The mesh device failed fatally underneath the transfer.
    Device,
}

impl Display for FailReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FailReason::NoResponse => f.write_str("no response to BEGIN"),
            FailReason::ChunkExhausted(idx) => write!(f, "chunk {idx} exhausted retries"),
            FailReason::FinalTimeout => f.write_str("no FIN after END"),
            FailReason::ReceiverError => f.write_str("receiver reported failure"),
            FailReason::IdleTimeout => f.write_str("receive idle timeout"),
            FailReason::SinkError => f.write_str("file sink failed"),
            FailReason::Aborted(r) => write!(f, "aborted: {r}"),
            FailReason::Device => f.write_str("mesh device failure"),
        }
    }
}

// ── Chunk splitting ──────────────────────────────────────────────────────────

/// Split file bytes into payload-sized chunks. Every chunk except the last
/// carries exactly `payload_max` bytes; the last carries the remainder
/// (1..=payload_max). Empty input yields no chunks.
pub fn split_into_chunks(data: &[u8], payload_max: usize) -> Vec<Bytes> {
    let src = Bytes::copy_from_slice(data);
    let mut out = Vec::with_capacity(data.len().div_ceil(payload_max.max(1)));
    let mut start = 0;
    while start < src.len() {
        let end = (start + payload_max).min(src.len());
        out.push(src.slice(start..end));
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_id_generate_is_wire_safe() {
        for _ in 0..32 {
            let tid = TransferId::generate();
            assert!(TransferId::parse(tid.as_str()).is_some());
            assert_eq!(tid.as_str().len(), 8);
        }
    }

    #[test]
    fn test_transfer_id_parse_rejects_bad_input() {
        assert!(TransferId::parse("abc").is_none()); // too short
        assert!(TransferId::parse("a|bcdef").is_none()); // field separator
        assert!(TransferId::parse("abc def").is_none()); // space
        assert!(TransferId::parse("0123456789abcdef0").is_none()); // too long
        assert!(TransferId::parse("abcdef").is_some());
    }

    #[test]
    fn test_split_exact_multiple() {
        let chunks = split_into_chunks(&[7u8; 240], 120);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 120);
        assert_eq!(chunks[1].len(), 120);
    }

    #[test]
    fn test_split_with_remainder() {
        let chunks = split_into_chunks(&[1u8; 300], 120);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].len(), 60);
    }

    #[test]
    fn test_split_single_byte() {
        let chunks = split_into_chunks(&[9u8], 120);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn test_split_empty() {
        assert!(split_into_chunks(&[], 120).is_empty());
    }

    #[test]
    fn test_abort_reason_roundtrip() {
        for r in [
            AbortReason::Busy,
            AbortReason::Protocol,
            AbortReason::IdleTimeout,
            AbortReason::Shutdown,
            AbortReason::User,
        ] {
            assert_eq!(AbortReason::from_token(r.token()), r);
        }
        assert_eq!(
            AbortReason::from_token("meteor"),
            AbortReason::Other("meteor".to_string())
        );
    }
}

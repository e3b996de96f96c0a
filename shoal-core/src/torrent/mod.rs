//! BitTorrent peer-wire download engine

pub mod bitfield;
pub mod metadata;
pub mod peer_connection;
pub mod peers;
pub mod protocol;
pub mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_data;
pub mod work_queue;
pub mod worker;

use std::fmt;
use std::time::Duration;

pub use bitfield::Bitfield;
pub use metadata::{MetadataDocument, PieceResult, PieceWork, TorrentMetadata};
pub use peer_connection::{ConnectionState, PeerConnection};
pub use peers::parse_compact_peers;
pub use protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
pub use scheduler::{DownloadSummary, PieceScheduler};
pub use work_queue::{Claim, QueueStats, WorkQueue, WorkerSlot};
pub use worker::{PeerWorker, WorkerReport};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the index as a usize for bitfield and buffer addressing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Connection-fatal variants (`PeerConnectionError`, `PeerTimeout`,
/// `ProtocolError`) end a single peer connection. `PieceHashMismatch` ends the
/// attempt at one piece. `InsufficientPeers` ends the whole run.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid torrent metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Invalid download configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Peer timed out during {operation} after {after:?}")]
    PeerTimeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("No usable peers remain, {remaining} pieces incomplete")]
    InsufficientPeers { remaining: usize },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TorrentError {
    /// Returns true for transport failures and deadline expiry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TorrentError::PeerConnectionError { .. } | TorrentError::PeerTimeout { .. }
        )
    }

    /// Returns true if the error ends the peer connection that raised it.
    pub fn is_connection_fatal(&self) -> bool {
        self.is_transport() || matches!(self, TorrentError::ProtocolError { .. })
    }

    /// Returns true if the error only invalidates a single piece attempt.
    pub fn is_piece_fatal(&self) -> bool {
        matches!(self, TorrentError::PieceHashMismatch { .. })
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
        }
    }
}

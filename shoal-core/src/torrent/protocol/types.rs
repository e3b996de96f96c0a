//! Core types and enumerations for BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// Protocol identifier carried in every handshake.
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Generated once per run and sent in every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID carrying the client prefix.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate(client_prefix: &str) -> Self {
        let mut id = [0u8; 20];
        let prefix = client_prefix.as_bytes();
        let prefix_len = prefix.len().min(id.len());
        id[..prefix_len].copy_from_slice(&prefix[..prefix_len]);
        for byte in &mut id[prefix_len..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// Wire message identifiers defined by BEP 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            other => Err(other),
        }
    }
}

/// BitTorrent wire protocol messages.
///
/// One variant per message id plus the id-less keep-alive frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Zero-length frame that keeps an idle connection open
    KeepAlive,
    /// Sender will not answer requests
    Choke,
    /// Sender will answer requests
    Unchoke,
    /// Sender wants pieces the receiver has
    Interested,
    /// Sender no longer wants pieces from the receiver
    NotInterested,
    /// Sender acquired a piece
    Have {
        /// Index of the newly acquired piece
        piece_index: PieceIndex,
    },
    /// Sender's complete piece availability map
    Bitfield {
        /// MSB-first availability bits
        bitfield: Bytes,
    },
    /// Ask for a block of a piece
    Request {
        /// Piece the block belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes requested
        length: u32,
    },
    /// A block of piece data
    Piece {
        /// Piece the block belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Block contents
        data: Bytes,
    },
    /// Withdraw an earlier Request
    Cancel {
        /// Piece the block belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
}

impl PeerMessage {
    /// Returns the wire id, or `None` for keep-alive.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            PeerMessage::KeepAlive => None,
            PeerMessage::Choke => Some(MessageId::Choke),
            PeerMessage::Unchoke => Some(MessageId::Unchoke),
            PeerMessage::Interested => Some(MessageId::Interested),
            PeerMessage::NotInterested => Some(MessageId::NotInterested),
            PeerMessage::Have { .. } => Some(MessageId::Have),
            PeerMessage::Bitfield { .. } => Some(MessageId::Bitfield),
            PeerMessage::Request { .. } => Some(MessageId::Request),
            PeerMessage::Piece { .. } => Some(MessageId::Piece),
            PeerMessage::Cancel { .. } => Some(MessageId::Cancel),
        }
    }

    /// Human readable message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "KeepAlive",
            PeerMessage::Choke => "Choke",
            PeerMessage::Unchoke => "Unchoke",
            PeerMessage::Interested => "Interested",
            PeerMessage::NotInterested => "NotInterested",
            PeerMessage::Have { .. } => "Have",
            PeerMessage::Bitfield { .. } => "Bitfield",
            PeerMessage::Request { .. } => "Request",
            PeerMessage::Piece { .. } => "Piece",
            PeerMessage::Cancel { .. } => "Cancel",
        }
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::Have { piece_index } => write!(f, "Have [{piece_index}]"),
            PeerMessage::Bitfield { bitfield } => write!(f, "Bitfield [{} bytes]", bitfield.len()),
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            }
            | PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => write!(f, "{} [{piece_index} @{offset} +{length}]", self.name()),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => write!(f, "Piece [{piece_index} @{offset} +{}]", data.len()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility
/// and verify info hash matching for torrent verification.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Reserved bytes for protocol extensions (always zero when sent by us)
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

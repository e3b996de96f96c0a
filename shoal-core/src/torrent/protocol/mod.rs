//! BitTorrent wire protocol abstractions and message types.
//!
//! BitTorrent peer-to-peer protocol implementation following BEP 3.
//! Defines the handshake, the length-prefixed message frames, and the
//! specialized builders and validators used by peer connections.

pub mod handshake;
pub mod messages;
pub mod types;

// Re-export public API
pub use handshake::{HANDSHAKE_LENGTH, HandshakeCodec};
pub use messages::{MAX_FRAME_LENGTH, MessageCodec};
pub use types::{MessageId, PROTOCOL_STRING, PeerHandshake, PeerId, PeerMessage};

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::torrent::PieceIndex;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate("-SH0001-");
        let bytes = peer_id.as_bytes();

        assert_eq!(&bytes[..8], b"-SH0001-");

        let peer_id2 = PeerId::generate("-SH0001-");
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_peer_id_prefix_is_truncated() {
        let peer_id = PeerId::generate("-THIS-PREFIX-IS-FAR-TOO-LONG-");
        assert_eq!(peer_id.as_bytes(), b"-THIS-PREFIX-IS-FAR-");
    }

    #[test]
    fn test_message_ids_match_wire_values() {
        assert_eq!(PeerMessage::KeepAlive.id(), None);
        assert_eq!(PeerMessage::Choke.id(), Some(MessageId::Choke));
        assert_eq!(
            MessageCodec::have(PieceIndex::new(1)).id().map(|id| id as u8),
            Some(4)
        );
        assert_eq!(MessageId::try_from(7), Ok(MessageId::Piece));
        assert_eq!(MessageId::try_from(9), Err(9));
    }

    #[test]
    fn test_message_display() {
        let piece = PeerMessage::Piece {
            piece_index: PieceIndex::new(3),
            offset: 16384,
            data: Bytes::from(vec![0u8; 100]),
        };
        assert_eq!(piece.to_string(), "Piece [3 @16384 +100]");
        assert_eq!(PeerMessage::KeepAlive.to_string(), "KeepAlive");
        assert_eq!(
            MessageCodec::request(PieceIndex::new(1), 0, 512).to_string(),
            "Request [1 @0 +512]"
        );
    }
}

//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{MessageId, PeerMessage};
use crate::torrent::{PieceIndex, TorrentError};

/// Largest frame body accepted from a peer.
///
/// Comfortably fits a 128 KiB block or the bitfield of a torrent with
/// millions of pieces, while refusing absurd allocations from hostile peers.
pub const MAX_FRAME_LENGTH: u32 = 2 * 1024 * 1024;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // Length = 0
            }
            PeerMessage::Choke
            | PeerMessage::Unchoke
            | PeerMessage::Interested
            | PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(Self::id_byte(message));
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // Length = 1 + 4
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            }
            | PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // Length = 1 + 4 + 4 + 4
                buf.put_u8(Self::id_byte(message));
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // Length = 1 + 4 + 4 + data.len()
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
        }

        buf
    }

    /// Deserializes a complete frame (length prefix included) following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated frame, unknown id, or bad payload size
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(TorrentError::protocol("Message too short"));
        }

        let mut buf = data;
        let length = buf.get_u32();

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if buf.len() < length as usize {
            return Err(TorrentError::protocol(format!(
                "Incomplete message: expected {length} bytes, have {}",
                buf.len()
            )));
        }

        Self::decode_body(Bytes::copy_from_slice(&buf[..length as usize]))
    }

    /// Decodes a frame body: id byte followed by the payload.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Empty body, unknown id, or bad payload size
    pub fn decode_body(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let raw_id = body.get_u8();
        let id = MessageId::try_from(raw_id)
            .map_err(|id| TorrentError::protocol(format!("Unknown message ID: {id}")))?;
        let payload_len = body.len();

        let expect_len = |expected: usize| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(TorrentError::protocol(format!(
                    "Invalid {id:?} payload length {payload_len}, expected {expected}"
                )))
            }
        };

        match id {
            MessageId::Choke => expect_len(0).map(|()| PeerMessage::Choke),
            MessageId::Unchoke => expect_len(0).map(|()| PeerMessage::Unchoke),
            MessageId::Interested => expect_len(0).map(|()| PeerMessage::Interested),
            MessageId::NotInterested => expect_len(0).map(|()| PeerMessage::NotInterested),
            MessageId::Have => {
                expect_len(4)?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                })
            }
            MessageId::Bitfield => Ok(PeerMessage::Bitfield { bitfield: body }),
            MessageId::Request | MessageId::Cancel => {
                expect_len(12)?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                if id == MessageId::Request {
                    Ok(PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    })
                } else {
                    Ok(PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    })
                }
            }
            MessageId::Piece => {
                if payload_len < 8 {
                    return Err(TorrentError::protocol(format!(
                        "Piece payload too short: {payload_len} < 8"
                    )));
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
        }
    }

    /// Reads the next frame from the stream.
    ///
    /// A clean close before the length prefix is reported as a connection
    /// error; a close inside a frame is a protocol error.
    ///
    /// # Errors
    /// - `TorrentError::PeerConnectionError` - Read failed or peer closed the connection
    /// - `TorrentError::ProtocolError` - Truncated or malformed frame
    pub async fn read_message<R>(reader: &mut R) -> Result<PeerMessage, TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        let mut length_buf = [0u8; 4];
        reader
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("Failed to read message length: {e}"),
            })?;

        let length = u32::from_be_bytes(length_buf);
        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if length > MAX_FRAME_LENGTH {
            return Err(TorrentError::protocol(format!(
                "Frame of {length} bytes exceeds limit of {MAX_FRAME_LENGTH}"
            )));
        }

        let mut body = vec![0u8; length as usize];
        reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TorrentError::protocol(format!("Frame truncated, expected {length} bytes"))
            } else {
                TorrentError::PeerConnectionError {
                    reason: format!("Failed to read message payload: {e}"),
                }
            }
        })?;

        Self::decode_body(Bytes::from(body))
    }

    /// Builds a Request for `length` bytes at `begin` within `index`.
    pub fn request(index: PieceIndex, begin: u32, length: u32) -> PeerMessage {
        PeerMessage::Request {
            piece_index: index,
            offset: begin,
            length,
        }
    }

    /// Builds a Have announcing `index`.
    pub fn have(index: PieceIndex) -> PeerMessage {
        PeerMessage::Have { piece_index: index }
    }

    /// Copies a Piece block into `destination` after validating it.
    ///
    /// Returns the number of bytes written. The block must belong to
    /// `expected_index` and fit entirely inside `destination`.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Not a Piece, wrong index, or out-of-bounds block
    pub fn parse_piece(
        expected_index: PieceIndex,
        destination: &mut [u8],
        message: &PeerMessage,
    ) -> Result<usize, TorrentError> {
        let PeerMessage::Piece {
            piece_index,
            offset,
            data,
        } = message
        else {
            return Err(TorrentError::protocol(format!(
                "Expected Piece, got {}",
                message.name()
            )));
        };

        if *piece_index != expected_index {
            return Err(TorrentError::protocol(format!(
                "Expected piece {expected_index}, got {piece_index}"
            )));
        }

        let begin = *offset as usize;
        if begin >= destination.len() {
            return Err(TorrentError::protocol(format!(
                "Begin offset too high: {begin} >= {}",
                destination.len()
            )));
        }

        let end = begin
            .checked_add(data.len())
            .filter(|end| *end <= destination.len())
            .ok_or_else(|| {
                TorrentError::protocol(format!(
                    "Block of {} bytes at offset {begin} overruns piece of {} bytes",
                    data.len(),
                    destination.len()
                ))
            })?;

        destination[begin..end].copy_from_slice(data);
        Ok(data.len())
    }

    /// Extracts the piece index from a Have message.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Message is not a Have
    pub fn parse_have(message: &PeerMessage) -> Result<PieceIndex, TorrentError> {
        match message {
            PeerMessage::Have { piece_index } => Ok(*piece_index),
            other => Err(TorrentError::protocol(format!(
                "Expected Have, got {}",
                other.name()
            ))),
        }
    }

    fn id_byte(message: &PeerMessage) -> u8 {
        message.id().map(|id| id as u8).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn piece_message(index: u32, offset: u32, data: Vec<u8>) -> PeerMessage {
        PeerMessage::Piece {
            piece_index: PieceIndex::new(index),
            offset,
            data: Bytes::from(data),
        }
    }

    #[test]
    fn test_round_trip_every_message_kind() {
        let messages = vec![
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
            MessageCodec::have(PieceIndex::new(42)),
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1010_0000, 0xFF]),
            },
            MessageCodec::request(PieceIndex::new(10), 16384, 16384),
            piece_message(3, 0, vec![1, 2, 3, 4, 5]),
            PeerMessage::Cancel {
                piece_index: PieceIndex::new(7),
                offset: 32768,
                length: 4096,
            },
        ];

        for original in messages {
            let frame = MessageCodec::serialize_message(&original);
            let decoded = MessageCodec::deserialize_message(&frame).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_wire_layout_of_request_and_have() {
        let frame = MessageCodec::serialize_message(&MessageCodec::request(
            PieceIndex::new(4),
            567,
            4321,
        ));
        assert_eq!(
            frame,
            vec![
                0x00, 0x00, 0x00, 0x0d, 6, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x02, 0x37, 0x00,
                0x00, 0x10, 0xe1
            ]
        );

        let frame = MessageCodec::serialize_message(&MessageCodec::have(PieceIndex::new(4)));
        assert_eq!(frame, vec![0x00, 0x00, 0x00, 0x05, 4, 0x00, 0x00, 0x00, 0x04]);

        let frame = MessageCodec::serialize_message(&PeerMessage::KeepAlive);
        assert_eq!(frame, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        // Unknown id
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 1, 20]).is_err());
        // Have with 3-byte payload
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 4, 4, 0, 0, 1]).is_err());
        // Piece with 7-byte payload
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 8, 7, 0, 0, 0, 1, 0, 0, 0]).is_err());
        // Length prefix larger than the frame
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 5, 4, 0]).is_err());
        // Choke carrying a payload
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 2, 0, 9]).is_err());
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let mut wire = MessageCodec::serialize_message(&PeerMessage::KeepAlive);
        wire.extend(MessageCodec::serialize_message(&MessageCodec::have(
            PieceIndex::new(9),
        )));
        let mut reader: &[u8] = &wire;

        assert_eq!(
            MessageCodec::read_message(&mut reader).await.unwrap(),
            PeerMessage::KeepAlive
        );
        assert_eq!(
            MessageCodec::read_message(&mut reader).await.unwrap(),
            MessageCodec::have(PieceIndex::new(9))
        );
        // Stream is exhausted: the peer hung up between frames
        assert!(matches!(
            MessageCodec::read_message(&mut reader).await,
            Err(TorrentError::PeerConnectionError { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_message_truncated_body_is_protocol_error() {
        let wire = MessageCodec::serialize_message(&piece_message(0, 0, vec![7; 32]));
        let mut reader: &[u8] = &wire[..20];
        assert!(matches!(
            MessageCodec::read_message(&mut reader).await,
            Err(TorrentError::ProtocolError { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_frame() {
        let wire = (MAX_FRAME_LENGTH + 1).to_be_bytes();
        let mut reader: &[u8] = &wire;
        assert!(matches!(
            MessageCodec::read_message(&mut reader).await,
            Err(TorrentError::ProtocolError { .. })
        ));
    }

    #[test]
    fn test_parse_piece_copies_full_block() {
        let mut destination = vec![0u8; 16384];
        let message = piece_message(0, 0, vec![0xAA; 16384]);

        let written =
            MessageCodec::parse_piece(PieceIndex::new(0), &mut destination, &message).unwrap();

        assert_eq!(written, 16384);
        assert!(destination.iter().all(|byte| *byte == 0xAA));
    }

    #[test]
    fn test_parse_piece_copies_at_offset() {
        let mut destination = vec![0u8; 10];
        let message = piece_message(4, 2, vec![0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        let written =
            MessageCodec::parse_piece(PieceIndex::new(4), &mut destination, &message).unwrap();

        assert_eq!(written, 6);
        assert_eq!(
            destination,
            vec![0x00, 0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00, 0x00]
        );
    }

    #[test]
    fn test_parse_piece_rejections() {
        let mut destination = vec![0u8; 10];

        // Wrong message type
        let have = MessageCodec::have(PieceIndex::new(4));
        assert!(MessageCodec::parse_piece(PieceIndex::new(4), &mut destination, &have).is_err());

        // Wrong index
        let wrong_index = piece_message(6, 0, vec![1, 2, 3]);
        assert!(
            MessageCodec::parse_piece(PieceIndex::new(4), &mut destination, &wrong_index).is_err()
        );

        // Begin past the end
        let begin_too_high = piece_message(4, 12, vec![1, 2, 3]);
        assert!(
            MessageCodec::parse_piece(PieceIndex::new(4), &mut destination, &begin_too_high)
                .is_err()
        );

        // Data overruns the buffer
        let too_long = piece_message(4, 2, vec![1; 9]);
        assert!(
            MessageCodec::parse_piece(PieceIndex::new(4), &mut destination, &too_long).is_err()
        );

        assert_eq!(destination, vec![0u8; 10]);
    }

    #[test]
    fn test_parse_have() {
        let index = MessageCodec::parse_have(&MessageCodec::have(PieceIndex::new(4))).unwrap();
        assert_eq!(index, PieceIndex::new(4));

        assert!(MessageCodec::parse_have(&PeerMessage::Choke).is_err());
        // A Have with a short payload never decodes in the first place
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 3, 4, 0, 0]).is_err());
    }

    proptest! {
        #[test]
        fn prop_piece_frames_round_trip(
            index in any::<u32>(),
            offset in any::<u32>(),
            data in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let original = piece_message(index, offset, data);
            let frame = MessageCodec::serialize_message(&original);
            prop_assert_eq!(MessageCodec::deserialize_message(&frame).unwrap(), original);
        }
    }
}

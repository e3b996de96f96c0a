//! BitTorrent handshake serialization and exchange

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PROTOCOL_STRING, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Size of a serialized handshake: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LENGTH: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = [0u8; HANDSHAKE_LENGTH];

        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Short input, wrong protocol length byte or protocol string
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() < HANDSHAKE_LENGTH {
            return Err(TorrentError::protocol(format!(
                "Handshake too short: {} < {HANDSHAKE_LENGTH} bytes",
                data.len()
            )));
        }

        let protocol_len = data[0] as usize;
        if protocol_len != PROTOCOL_STRING.len() {
            return Err(TorrentError::protocol(format!(
                "Unexpected protocol string length {protocol_len}"
            )));
        }

        if &data[1..20] != PROTOCOL_STRING {
            return Err(TorrentError::protocol(format!(
                "Unknown protocol {:?}",
                String::from_utf8_lossy(&data[1..20])
            )));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&data[28..48]);

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&data[48..68]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash_bytes),
            peer_id: PeerId::new(peer_id_bytes),
        })
    }

    /// Reads exactly one handshake from the stream.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Stream ended early or handshake malformed
    /// - `TorrentError::PeerConnectionError` - Read failed
    pub async fn read_handshake<R>(reader: &mut R) -> Result<PeerHandshake, TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        reader.read_exact(&mut buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TorrentError::protocol("Handshake truncated")
            } else {
                TorrentError::PeerConnectionError {
                    reason: format!("Failed to read handshake: {e}"),
                }
            }
        })?;

        Self::deserialize_handshake(&buf)
    }

    /// Sends our handshake, then reads and validates the peer's.
    ///
    /// The whole exchange runs under `deadline`. The peer's id is returned but
    /// not checked; its info hash must match ours byte for byte.
    ///
    /// # Errors
    /// - `TorrentError::PeerTimeout` - Exchange did not finish before the deadline
    /// - `TorrentError::PeerConnectionError` - Write or read failed
    /// - `TorrentError::ProtocolError` - Malformed reply or info hash mismatch
    pub async fn exchange<S>(
        stream: &mut S,
        handshake: &PeerHandshake,
        deadline: Duration,
    ) -> Result<PeerHandshake, TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = async {
            stream
                .write_all(&Self::serialize_handshake(handshake))
                .await
                .map_err(|e| TorrentError::PeerConnectionError {
                    reason: format!("Failed to send handshake: {e}"),
                })?;

            let reply = Self::read_handshake(stream).await?;
            if reply.info_hash != handshake.info_hash {
                return Err(TorrentError::protocol(format!(
                    "Expected info hash {} but peer sent {}",
                    handshake.info_hash, reply.info_hash
                )));
            }
            Ok(reply)
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TorrentError::PeerTimeout {
                operation: "handshake",
                after: deadline,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handshake() -> PeerHandshake {
        PeerHandshake::new(InfoHash::new([0xAB; 20]), PeerId::new([0x11; 20]))
    }

    #[test]
    fn test_serialized_layout() {
        let bytes = HandshakeCodec::serialize_handshake(&sample_handshake());

        assert_eq!(bytes.len(), HANDSHAKE_LENGTH);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[0xAB; 20]);
        assert_eq!(&bytes[48..68], &[0x11; 20]);
    }

    #[test]
    fn test_round_trip_recovers_hash_and_peer_id() {
        let original = sample_handshake();
        let bytes = HandshakeCodec::serialize_handshake(&original);
        let parsed = HandshakeCodec::deserialize_handshake(&bytes).unwrap();

        assert_eq!(parsed.info_hash, original.info_hash);
        assert_eq!(parsed.peer_id, original.peer_id);
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_rejects_short_input() {
        let bytes = HandshakeCodec::serialize_handshake(&sample_handshake());
        let result = HandshakeCodec::deserialize_handshake(&bytes[..67]);
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[test]
    fn test_rejects_wrong_protocol_length() {
        let mut bytes = HandshakeCodec::serialize_handshake(&sample_handshake());
        bytes[0] = 18;
        let result = HandshakeCodec::deserialize_handshake(&bytes);
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_read_handshake_truncated_stream() {
        let bytes = HandshakeCodec::serialize_handshake(&sample_handshake());
        let mut reader: &[u8] = &bytes[..40];
        let result = HandshakeCodec::read_handshake(&mut reader).await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_exchange_writes_first_then_accepts_matching_reply() {
        let ours = sample_handshake();
        let theirs = PeerHandshake::new(ours.info_hash, PeerId::new([0x22; 20]));

        let mut stream = tokio_test::io::Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours))
            .read(&HandshakeCodec::serialize_handshake(&theirs))
            .build();

        let reply = HandshakeCodec::exchange(&mut stream, &ours, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.peer_id, PeerId::new([0x22; 20]));
    }

    #[tokio::test]
    async fn test_exchange_rejects_info_hash_mismatch() {
        let ours = sample_handshake();
        let theirs = PeerHandshake::new(InfoHash::new([0xCD; 20]), PeerId::new([0x22; 20]));

        let mut stream = tokio_test::io::Builder::new()
            .write(&HandshakeCodec::serialize_handshake(&ours))
            .read(&HandshakeCodec::serialize_handshake(&theirs))
            .build();

        let result = HandshakeCodec::exchange(&mut stream, &ours, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(TorrentError::ProtocolError { .. })));
    }

    #[tokio::test]
    async fn test_exchange_times_out_on_silent_peer() {
        let ours = sample_handshake();
        // Keep the far end open but never answer.
        let (mut local, _remote) = tokio::io::duplex(1024);

        let result =
            HandshakeCodec::exchange(&mut local, &ours, Duration::from_millis(50)).await;
        assert!(matches!(
            result,
            Err(TorrentError::PeerTimeout {
                operation: "handshake",
                ..
            })
        ));
    }
}

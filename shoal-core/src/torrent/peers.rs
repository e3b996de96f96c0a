//! Peer address list decoding.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use super::TorrentError;

/// Bytes per entry in a compact peer list: 4-byte IPv4 plus 2-byte port.
pub const COMPACT_PEER_LENGTH: usize = 6;

/// Decodes a compact peer list as returned by trackers.
///
/// # Errors
/// - `TorrentError::ProtocolError` - Length is not a multiple of 6 bytes
pub fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if !peer_bytes.len().is_multiple_of(COMPACT_PEER_LENGTH) {
        return Err(TorrentError::protocol(format!(
            "Compact peer list of {} bytes is not a multiple of {COMPACT_PEER_LENGTH}",
            peer_bytes.len()
        )));
    }

    Ok(peer_bytes
        .chunks_exact(COMPACT_PEER_LENGTH)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// Encodes IPv4 peers into the compact form. IPv6 addresses are skipped.
pub fn encode_compact_peers(peers: &[SocketAddr]) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(peers.len() * COMPACT_PEER_LENGTH);
    for peer in peers {
        if let SocketAddr::V4(v4) = peer {
            encoded.extend_from_slice(&v4.ip().octets());
            encoded.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    encoded
}

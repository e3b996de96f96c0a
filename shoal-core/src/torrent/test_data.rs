//! Test data creation for torrent testing.
//!
//! Provides deterministic torrent content and matching metadata so the
//! engine, the simulated peers, and integration tests agree on every hash.

use sha1::{Digest, Sha1};

use super::{InfoHash, PieceIndex, TorrentMetadata};

/// Torrent content together with the metadata describing it.
#[derive(Debug, Clone)]
pub struct TestTorrent {
    pub metadata: TorrentMetadata,
    pub content: Vec<u8>,
}

impl TestTorrent {
    /// Returns the bytes of a single piece.
    pub fn piece_data(&self, index: PieceIndex) -> &[u8] {
        let start = self.metadata.piece_offset(index) as usize;
        let end = start + self.metadata.piece_size(index) as usize;
        &self.content[start..end]
    }
}

/// Creates content of `total_length` bytes split into `piece_length` pieces.
///
/// Bytes follow a pattern that differs between pieces, so a block served
/// from the wrong piece or offset fails verification.
pub fn create_test_torrent(piece_length: u32, total_length: u64) -> TestTorrent {
    let content: Vec<u8> = (0..total_length)
        .map(|i| {
            let piece = i / piece_length as u64;
            (i.wrapping_mul(31) ^ piece.wrapping_mul(97)) as u8
        })
        .collect();

    let piece_hashes = content
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect();

    let info_hash = {
        let mut hasher = Sha1::new();
        hasher.update(piece_length.to_be_bytes());
        hasher.update(total_length.to_be_bytes());
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());
        InfoHash::new(hash)
    };

    TestTorrent {
        metadata: TorrentMetadata {
            announce: "http://tracker.example.com/announce".to_string(),
            name: "test.bin".to_string(),
            piece_length,
            total_length,
            piece_hashes,
            info_hash,
        },
        content,
    }
}

//! Piece availability bitmap exchanged in Bitfield messages.

/// Byte-packed piece availability, most significant bit first.
///
/// Bit `i` lives in byte `i / 8` at position `7 - i % 8`. Reads and writes
/// past the end of the buffer are silent no-ops: peers may send bitfields of
/// any length, and callers validate piece indices against the torrent where
/// it matters. Use [`Bitfield::checked_has_piece`] to tell "absent" apart
/// from "out of range".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
}

impl Bitfield {
    /// Creates an empty bitfield large enough for `piece_count` pieces.
    pub fn with_piece_count(piece_count: usize) -> Self {
        Self {
            bytes: vec![0u8; piece_count.div_ceil(8)],
        }
    }

    /// Wraps a raw Bitfield payload as received from a peer.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Returns true if the peer advertises `index`; false when out of range.
    pub fn has_piece(&self, index: usize) -> bool {
        self.checked_has_piece(index).unwrap_or(false)
    }

    /// Like [`Bitfield::has_piece`] but returns `None` when `index` lies
    /// outside the buffer.
    pub fn checked_has_piece(&self, index: usize) -> Option<bool> {
        let byte = *self.bytes.get(index / 8)?;
        let offset = index % 8;
        Some((byte >> (7 - offset)) & 1 != 0)
    }

    /// Marks `index` as available; does nothing when out of range.
    pub fn set_piece(&mut self, index: usize) {
        let offset = index % 8;
        if let Some(byte) = self.bytes.get_mut(index / 8) {
            *byte |= 1 << (7 - offset);
        }
    }

    /// Number of indices addressable by this buffer (8 per byte).
    pub fn capacity(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bytes.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Raw wire representation.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

//! Torrent metadata as supplied by the metadata provider, and the piece work
//! derived from it.

use serde::{Deserialize, Serialize};

use super::{InfoHash, PieceIndex, TorrentError};

/// Complete metadata needed to download a single-file torrent.
///
/// Produced by an external parser; read-only to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentMetadata {
    pub announce: String,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub info_hash: InfoHash,
}

/// One piece waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: PieceIndex,
    pub length: u32,
    pub hash: [u8; 20],
}

/// A verified piece on its way to the output sink.
#[derive(Debug, Clone)]
pub struct PieceResult {
    pub index: PieceIndex,
    pub data: Vec<u8>,
}

impl TorrentMetadata {
    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte offset of `index` within the assembled file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index.as_u32() as u64 * self.piece_length as u64
    }

    /// Length of `index`; the final piece holds whatever remains.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let start = self.piece_offset(index);
        let end = (start + self.piece_length as u64).min(self.total_length);
        end.saturating_sub(start) as u32
    }

    /// Checks piece count against the declared lengths.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Zero lengths or piece hashes not matching the length
    pub fn validate(&self) -> Result<(), TorrentError> {
        if self.piece_length == 0 {
            return Err(TorrentError::InvalidMetadata {
                reason: "piece length is zero".to_string(),
            });
        }
        if self.total_length == 0 {
            return Err(TorrentError::InvalidMetadata {
                reason: "total length is zero".to_string(),
            });
        }

        let expected = self.total_length.div_ceil(self.piece_length as u64);
        if expected != self.piece_hashes.len() as u64 {
            return Err(TorrentError::InvalidMetadata {
                reason: format!(
                    "{} bytes in {}-byte pieces needs {expected} hashes, found {}",
                    self.total_length,
                    self.piece_length,
                    self.piece_hashes.len()
                ),
            });
        }

        if expected > u32::MAX as u64 {
            return Err(TorrentError::InvalidMetadata {
                reason: format!("{expected} pieces exceeds the wire protocol limit"),
            });
        }

        Ok(())
    }

    /// Builds the ordered work list, one item per piece.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Metadata failed validation
    pub fn piece_work(&self) -> Result<Vec<PieceWork>, TorrentError> {
        self.validate()?;

        Ok(self
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                let index = PieceIndex::new(i as u32);
                PieceWork {
                    index,
                    length: self.piece_size(index),
                    hash: *hash,
                }
            })
            .collect())
    }

    /// Parses the JSON interchange form.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Malformed JSON, bad hex, or inconsistent lengths
    pub fn from_json(json: &str) -> Result<Self, TorrentError> {
        let document: MetadataDocument =
            serde_json::from_str(json).map_err(|e| TorrentError::InvalidMetadata {
                reason: format!("malformed metadata document: {e}"),
            })?;
        Self::try_from(document)
    }

    /// Renders the JSON interchange form.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMetadata` - Serialization failed
    pub fn to_json(&self) -> Result<String, TorrentError> {
        serde_json::to_string_pretty(&MetadataDocument::from(self)).map_err(|e| {
            TorrentError::InvalidMetadata {
                reason: format!("could not serialize metadata: {e}"),
            }
        })
    }
}

/// JSON interchange form of [`TorrentMetadata`] with hex-encoded hashes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(default)]
    pub announce: String,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub info_hash: String,
    pub pieces: Vec<String>,
}

impl TryFrom<MetadataDocument> for TorrentMetadata {
    type Error = TorrentError;

    fn try_from(document: MetadataDocument) -> Result<Self, Self::Error> {
        let info_hash = InfoHash::new(decode_digest(&document.info_hash, "info_hash")?);
        let piece_hashes = document
            .pieces
            .iter()
            .enumerate()
            .map(|(i, hash)| decode_digest(hash, &format!("pieces[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;

        let metadata = TorrentMetadata {
            announce: document.announce,
            name: document.name,
            piece_length: document.piece_length,
            total_length: document.total_length,
            piece_hashes,
            info_hash,
        };
        metadata.validate()?;
        Ok(metadata)
    }
}

impl From<&TorrentMetadata> for MetadataDocument {
    fn from(metadata: &TorrentMetadata) -> Self {
        Self {
            announce: metadata.announce.clone(),
            name: metadata.name.clone(),
            piece_length: metadata.piece_length,
            total_length: metadata.total_length,
            info_hash: hex::encode(metadata.info_hash.as_bytes()),
            pieces: metadata.piece_hashes.iter().map(hex::encode).collect(),
        }
    }
}

fn decode_digest(value: &str, field: &str) -> Result<[u8; 20], TorrentError> {
    let mut digest = [0u8; 20];
    hex::decode_to_slice(value, &mut digest).map_err(|e| TorrentError::InvalidMetadata {
        reason: format!("{field} is not a 40-character hex digest: {e}"),
    })?;
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::test_data::create_test_torrent;

    #[test]
    fn test_piece_work_truncates_final_piece() {
        let metadata = TorrentMetadata {
            announce: String::new(),
            name: "odd.bin".to_string(),
            piece_length: 100,
            total_length: 250,
            piece_hashes: vec![[1u8; 20], [2u8; 20], [3u8; 20]],
            info_hash: InfoHash::new([9u8; 20]),
        };

        let work = metadata.piece_work().unwrap();
        let lengths: Vec<u32> = work.iter().map(|w| w.length).collect();
        assert_eq!(lengths, vec![100, 100, 50]);
        assert_eq!(work[2].hash, [3u8; 20]);
        assert_eq!(metadata.piece_offset(PieceIndex::new(2)), 200);
    }

    #[test]
    fn test_validate_rejects_hash_count_mismatch() {
        let mut metadata = create_test_torrent(32768, 32768 * 3).metadata;
        metadata.piece_hashes.pop();
        assert!(matches!(
            metadata.validate(),
            Err(TorrentError::InvalidMetadata { .. })
        ));

        metadata.piece_length = 0;
        assert!(metadata.piece_work().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let metadata = create_test_torrent(16384, 16384 * 3 + 10).metadata;
        let json = metadata.to_json().unwrap();
        assert!(json.contains(&hex::encode(metadata.info_hash.as_bytes())));

        let parsed = TorrentMetadata::from_json(&json).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_json_rejects_bad_digest() {
        let json = r#"{
            "name": "x",
            "piece_length": 10,
            "total_length": 10,
            "info_hash": "abcd",
            "pieces": ["0000000000000000000000000000000000000000"]
        }"#;
        let error = TorrentMetadata::from_json(json).unwrap_err();
        assert!(error.to_string().contains("info_hash"));
    }
}

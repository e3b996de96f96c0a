//! Shoal Core - BitTorrent peer-wire download engine
//!
//! This crate provides the building blocks for downloading a single torrent
//! from a swarm of peers: wire protocol codecs, per-peer connection state
//! machines, the shared piece scheduler, output sinks, and configuration.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::ShoalConfig;
pub use storage::{FileSink, MemorySink, PieceSink, StorageError};
pub use torrent::{DownloadSummary, PieceScheduler, TorrentError, TorrentMetadata};

/// Core errors that can bubble up from any Shoal subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum ShoalError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShoalError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            ShoalError::Torrent(e) => match e {
                TorrentError::InvalidMetadata { reason } => {
                    format!("Invalid torrent metadata: {reason}")
                }
                TorrentError::InvalidConfiguration { reason } => {
                    format!("Configuration error: {reason}")
                }
                TorrentError::InsufficientPeers { remaining } => {
                    format!("Ran out of usable peers with {remaining} pieces left")
                }
                _ => "Download error occurred".to_string(),
            },
            ShoalError::Storage(_) => "Could not write downloaded data".to_string(),
            ShoalError::Configuration { reason } => format!("Configuration error: {reason}"),
            ShoalError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            ShoalError::Configuration { .. }
                | ShoalError::Torrent(
                    TorrentError::InvalidMetadata { .. } | TorrentError::InvalidConfiguration { .. }
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, ShoalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_for_insufficient_peers() {
        let error = ShoalError::from(TorrentError::InsufficientPeers { remaining: 3 });
        assert_eq!(
            error.user_message(),
            "Ran out of usable peers with 3 pieces left"
        );
        assert!(!error.is_user_error());
    }

    #[test]
    fn test_invalid_metadata_is_user_error() {
        let error = ShoalError::from(TorrentError::InvalidMetadata {
            reason: "no pieces".to_string(),
        });
        assert!(error.is_user_error());
        assert!(error.user_message().contains("no pieces"));
    }
}

//! Storage layer for downloaded torrent data.
//!
//! The engine writes each verified piece exactly once at
//! `index * piece_length`. Pieces finish out of order, so every sink must
//! support random-access writes.

pub mod file_sink;
pub mod memory_sink;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

use async_trait::async_trait;
pub use file_sink::FileSink;
pub use memory_sink::{MemorySink, SinkWrite};

/// Destination for verified piece data.
#[async_trait]
pub trait PieceSink: Send {
    /// Writes `bytes` starting at `offset` within the output.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfBounds` - If the write extends past the declared length
    /// - `StorageError::AlreadyWritten` - If the sink tracks writes and the range was written before
    /// - `StorageError::Io` - If the underlying write failed
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError>;

    /// Flushes all data once every piece has been written.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If flushing to the backing store failed
    async fn finalize(&mut self) -> Result<(), StorageError>;
}

/// Errors that occur while writing downloaded data.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Write would extend past the declared output length
    #[error("Write of {length} bytes at offset {offset} exceeds output length {total_length}")]
    OutOfBounds {
        offset: u64,
        length: usize,
        total_length: u64,
    },

    /// Offset already received a write
    #[error("Offset {offset} was already written")]
    AlreadyWritten { offset: u64 },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn check_bounds(
    offset: u64,
    length: usize,
    total_length: u64,
) -> Result<(), StorageError> {
    let fits = offset
        .checked_add(length as u64)
        .is_some_and(|end| end <= total_length);
    if fits {
        Ok(())
    } else {
        Err(StorageError::OutOfBounds {
            offset,
            length,
            total_length,
        })
    }
}

//! In-memory output that records every write.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PieceSink, StorageError, check_bounds};

/// One recorded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkWrite {
    pub offset: u64,
    pub length: usize,
}

#[derive(Debug)]
struct MemoryState {
    buffer: Vec<u8>,
    writes: Vec<SinkWrite>,
    finalized: bool,
}

/// Sink backed by a shared buffer.
///
/// Clones share the same buffer, so a test can hand one clone to the
/// scheduler and inspect another afterwards. A second write at an offset
/// that was already written is rejected.
#[derive(Debug, Clone)]
pub struct MemorySink {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    pub fn new(total_length: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                buffer: vec![0u8; total_length as usize],
                writes: Vec::new(),
                finalized: false,
            })),
        }
    }

    /// Copy of the buffer contents.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().buffer.clone()
    }

    /// Writes in the order they were received.
    pub fn writes(&self) -> Vec<SinkWrite> {
        self.state.lock().writes.clone()
    }

    pub fn bytes_written(&self) -> u64 {
        self.state
            .lock()
            .writes
            .iter()
            .map(|write| write.length as u64)
            .sum()
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }
}

#[async_trait]
impl PieceSink for MemorySink {
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        check_bounds(offset, bytes.len(), state.buffer.len() as u64)?;

        if state.writes.iter().any(|write| write.offset == offset) {
            return Err(StorageError::AlreadyWritten { offset });
        }

        let start = offset as usize;
        state.buffer[start..start + bytes.len()].copy_from_slice(bytes);
        state.writes.push(SinkWrite {
            offset,
            length: bytes.len(),
        });
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), StorageError> {
        self.state.lock().finalized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_writes_and_contents() {
        let sink = MemorySink::new(6);
        let mut writer = sink.clone();

        writer.write_at(3, b"def").await.unwrap();
        writer.write_at(0, b"abc").await.unwrap();
        writer.finalize().await.unwrap();

        assert_eq!(sink.contents(), b"abcdef");
        assert_eq!(
            sink.writes(),
            vec![
                SinkWrite {
                    offset: 3,
                    length: 3
                },
                SinkWrite {
                    offset: 0,
                    length: 3
                },
            ]
        );
        assert_eq!(sink.bytes_written(), 6);
        assert!(sink.is_finalized());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_out_of_bounds() {
        let mut sink = MemorySink::new(4);
        sink.write_at(0, b"ab").await.unwrap();

        assert!(matches!(
            sink.write_at(0, b"ab").await,
            Err(StorageError::AlreadyWritten { offset: 0 })
        ));
        assert!(matches!(
            sink.write_at(3, b"xy").await,
            Err(StorageError::OutOfBounds { .. })
        ));
        assert_eq!(sink.bytes_written(), 2);
    }
}

//! Random-access file output.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{PieceSink, StorageError, check_bounds};

/// Writes pieces into a single preallocated file.
pub struct FileSink {
    path: PathBuf,
    file: File,
    total_length: u64,
}

impl FileSink {
    /// Creates (or truncates) `path` and sizes it to `total_length` bytes.
    ///
    /// Missing parent directories are created.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file could not be created or resized
    pub async fn create(path: impl AsRef<Path>, total_length: u64) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let file = File::create(&path).await?;
        file.set_len(total_length).await?;
        tracing::debug!("Created output {} ({total_length} bytes)", path.display());

        Ok(Self {
            path,
            file,
            total_length,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PieceSink for FileSink {
    async fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, bytes.len(), self.total_length)?;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(bytes).await?;
        // tokio completes writes in the background; the next seek needs them done
        self.file.flush().await?;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<(), StorageError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tracing::debug!("Finalized output {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_fixtures::create_temp_output;

    #[tokio::test]
    async fn test_out_of_order_writes_land_at_offsets() {
        let (_dir, path) = create_temp_output("out.bin");
        let mut sink = FileSink::create(&path, 10).await.unwrap();

        sink.write_at(6, b"WXYZ").await.unwrap();
        sink.write_at(0, b"ABC").await.unwrap();
        sink.finalize().await.unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"ABC\0\0\0WXYZ");
    }

    #[tokio::test]
    async fn test_rejects_write_past_end() {
        let (_dir, path) = create_temp_output("nested/dir/out.bin");
        let mut sink = FileSink::create(&path, 8).await.unwrap();
        assert_eq!(sink.path(), path.as_path());

        let result = sink.write_at(4, b"12345").await;
        assert!(matches!(result, Err(StorageError::OutOfBounds { .. })));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }
}

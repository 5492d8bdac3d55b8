use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::store::block::BlockId;

/// Storage collaborator the cache fetches through.
///
/// Implementations perform the long-latency work (disk, network) off the
/// caller's thread of control; the cache only ever awaits the result.
#[async_trait]
pub trait BlockReader: Send + Sync {
    /// Reads exactly `size` bytes for `id`. Returning fewer bytes is a
    /// fetch failure, not a partial success.
    async fn read_block(&self, id: BlockId, size: usize) -> Result<Vec<u8>>;
}

/// Reads blocks stored back-to-back in a single chunk file, block `i` at
/// byte offset `i * block_size`.
///
/// Reads run on the blocking thread pool so the caller's task is never
/// stalled on disk latency.
pub struct FileChunkReader {
    file: Arc<File>,
    block_size: usize,
    path: PathBuf,
}

impl FileChunkReader {
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            file: Arc::new(file),
            block_size,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

#[async_trait]
impl BlockReader for FileChunkReader {
    async fn read_block(&self, id: BlockId, size: usize) -> Result<Vec<u8>> {
        let file = self.file.clone();
        let offset = id.index as u64 * self.block_size as u64;

        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; size];
            file.read_exact_at(&mut buf, offset)?;
            Ok::<_, io::Error>(buf)
        })
        .await
        .map_err(|e| Error::BlockFetch {
            id,
            reason: format!("read task failed: {}", e),
        })?;

        result.map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::BlockFetch {
                id,
                reason: format!("short read at offset {} in {}", offset, self.path.display()),
            },
            _ => Error::from(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn chunk_file(blocks: &[&[u8]]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for block in blocks {
            file.write_all(block).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_read_block_at_offset() -> Result<()> {
        let file = chunk_file(&[&[1u8; 16], &[2u8; 16], &[3u8; 16]]);
        let reader = FileChunkReader::open(file.path(), 16)?;

        let bytes = reader.read_block(BlockId::new(9, 1), 16).await?;
        assert_eq!(bytes, vec![2u8; 16]);

        // A short trailing block can be read with its actual size.
        let bytes = reader.read_block(BlockId::new(9, 2), 8).await?;
        assert_eq!(bytes, vec![3u8; 8]);
        Ok(())
    }

    #[tokio::test]
    async fn test_short_read_is_a_fetch_failure() -> Result<()> {
        let file = chunk_file(&[&[1u8; 16]]);
        let reader = FileChunkReader::open(file.path(), 16)?;

        let err = reader.read_block(BlockId::new(9, 1), 16).await.unwrap_err();
        assert!(matches!(err, Error::BlockFetch { .. }));
        Ok(())
    }
}

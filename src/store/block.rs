use std::fmt;
use std::ops::{Deref, Range};
use std::sync::{Arc, OnceLock};

use crate::error::{Error, Result};
use crate::hasher;

/// Identity of a block: the chunk it belongs to plus its index within that
/// chunk. Never changes over the block's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId {
    pub chunk_id: u64,
    pub index: u32,
}

impl BlockId {
    pub fn new(chunk_id: u64, index: u32) -> Self {
        Self { chunk_id, index }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk_id, self.index)
    }
}

/// An immutable, cheaply clonable byte payload.
///
/// Clones share the backing buffer; the buffer lives as long as the longest
/// holder, so a reference obtained from the cache stays valid past eviction.
#[derive(Clone)]
pub struct SharedRef {
    data: Arc<Vec<u8>>,
    offset: usize,
    len: usize,
}

impl SharedRef {
    pub fn new(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            data: Arc::new(data),
            offset: 0,
            len,
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// Returns a window into the same backing buffer. `range` is relative
    /// to this ref and must be in bounds.
    pub fn slice(&self, range: Range<usize>) -> SharedRef {
        assert!(range.start <= range.end && range.end <= self.len);
        Self {
            data: self.data.clone(),
            offset: self.offset + range.start,
            len: range.end - range.start,
        }
    }
}

impl Deref for SharedRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for SharedRef {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<Vec<u8>> for SharedRef {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl PartialEq for SharedRef {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for SharedRef {}

impl fmt::Debug for SharedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedRef({} bytes)", self.len)
    }
}

struct BlockInner {
    id: BlockId,
    data: SharedRef,
    checksum: OnceLock<u64>,
}

/// A block resident in (or handed out by) the cache.
///
/// The payload is immutable once constructed. Clones share the same inner
/// state, including the lazily computed checksum.
#[derive(Clone)]
pub struct CachedBlock {
    inner: Arc<BlockInner>,
}

impl CachedBlock {
    pub fn new(id: BlockId, data: SharedRef) -> Self {
        Self {
            inner: Arc::new(BlockInner {
                id,
                data,
                checksum: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> BlockId {
        self.inner.id
    }

    pub fn data(&self) -> &SharedRef {
        &self.inner.data
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// CRC-64 of the payload, computed on first request and cached.
    pub fn checksum(&self) -> u64 {
        *self
            .inner
            .checksum
            .get_or_init(|| hasher::checksum_of(self.inner.data.as_slice()))
    }

    /// Verifies the payload against a previously recorded checksum, e.g.
    /// one taken from [`BlockBuilder::checksum`](crate::BlockBuilder::checksum)
    /// at write time.
    pub fn verify_checksum(&self, expected: u64) -> Result<()> {
        if self.checksum() == expected {
            Ok(())
        } else {
            Err(Error::ChecksumMismatch)
        }
    }
}

impl fmt::Debug for CachedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CachedBlock({}, {} bytes)", self.id(), self.len())
    }
}

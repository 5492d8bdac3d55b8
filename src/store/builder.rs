use byteorder::{BigEndian, ByteOrder};

use crate::arena::ChunkedPool;
use crate::hasher::Hasher;
use crate::store::block::SharedRef;

/// Assembles a block payload from appended fragments.
///
/// Fragments are staged in a caller-supplied pool whose lifecycle is the
/// surrounding write operation; `finish()` seals them into an immutable
/// payload suitable for [`BlockStore::put_block`](crate::BlockStore::put_block).
/// A rolling checksum over everything appended is maintained as a side
/// effect so writers can record payload integrity without a second pass.
pub struct BlockBuilder<'a> {
    pool: &'a ChunkedPool,
    fragments: Vec<&'a [u8]>,
    size: usize,
    hasher: Hasher,
}

impl<'a> BlockBuilder<'a> {
    pub fn new(pool: &'a ChunkedPool) -> Self {
        Self {
            pool,
            fragments: Vec::new(),
            size: 0,
            hasher: Hasher::new(),
        }
    }

    /// Appends raw bytes to the payload.
    pub fn append(&mut self, data: &[u8]) {
        let pool: &'a ChunkedPool = self.pool;
        let staged = pool.allocate_unaligned(data.len());
        staged.copy_from_slice(data);
        self.hasher.write(data);
        self.size += data.len();
        self.fragments.push(staged);
    }

    /// Appends a big-endian u32.
    pub fn append_u32(&mut self, value: u32) {
        let mut buf = [0u8; 4];
        BigEndian::write_u32(&mut buf, value);
        self.append(&buf);
    }

    /// Appends a big-endian u64.
    pub fn append_u64(&mut self, value: u64) {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, value);
        self.append(&buf);
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// CRC-64 of everything appended so far.
    pub fn checksum(&self) -> u64 {
        self.hasher.checksum()
    }

    /// Seals the staged fragments into an immutable payload.
    pub fn finish(self) -> SharedRef {
        let mut data = Vec::with_capacity(self.size);
        for fragment in self.fragments {
            data.extend_from_slice(fragment);
        }
        SharedRef::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::hasher;
    use byteorder::ReadBytesExt;

    #[test]
    fn test_build_payload_from_fragments() {
        let pool = ChunkedPool::new(PoolConfig::default().chunk_size(1024).tag("builder-test"));
        let mut builder = BlockBuilder::new(&pool);
        assert!(builder.is_empty());

        builder.append(b"header");
        builder.append_u32(0xDEAD_BEEF);
        builder.append(b"body");
        assert_eq!(builder.len(), 6 + 4 + 4);

        let payload = builder.finish();
        assert_eq!(&payload[..6], b"header");
        assert_eq!(&payload[10..], b"body");

        let mut cursor = std::io::Cursor::new(&payload[6..10]);
        assert_eq!(cursor.read_u32::<BigEndian>().unwrap(), 0xDEAD_BEEF);

        // Fragments were staged in the pool.
        assert_eq!(pool.size(), 14);
    }

    #[test]
    fn test_builder_checksum_matches_payload() {
        let pool = ChunkedPool::new(PoolConfig::default().chunk_size(1024));
        let mut builder = BlockBuilder::new(&pool);
        builder.append(b"part one ");
        builder.append(b"part two");

        let checksum = builder.checksum();
        let payload = builder.finish();
        assert_eq!(checksum, hasher::checksum_of(&payload));
    }

    #[test]
    fn test_builder_spills_across_chunks() {
        // 256B chunks force fragment staging to span several chunks.
        let pool = ChunkedPool::new(PoolConfig::default().chunk_size(256));
        let mut builder = BlockBuilder::new(&pool);

        for i in 0..64u8 {
            builder.append(&[i; 10]);
        }

        let payload = builder.finish();
        assert_eq!(payload.len(), 640);
        for i in 0..64usize {
            assert!(payload[i * 10..(i + 1) * 10].iter().all(|b| *b == i as u8));
        }
    }
}

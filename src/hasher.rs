use std::fmt;

use crc::{Crc, Digest, CRC_64_ECMA_182};

pub static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Convenience for one-shot payload checksums.
pub fn checksum_of(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}

/// Incremental CRC-64 hasher for block payloads assembled in fragments.
#[derive(Clone)]
pub struct Hasher {
    digest: Digest<'static, u64>,
}

impl fmt::Debug for Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hasher")
    }
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            digest: CRC64.digest(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    pub fn checksum(&self) -> u64 {
        self.digest.clone().finalize()
    }

    pub fn reset(&mut self) {
        self.digest = CRC64.digest();
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for a chunked memory pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Size of each owned chunk in bytes (default: 1MB)
    pub chunk_size: usize,

    /// Fraction of the chunk size above which an allocation bypasses the
    /// bump cursor and gets a dedicated buffer (default: 0.25). Must be
    /// at most 0.5 so any small request always fits a fresh chunk.
    pub max_small_block_ratio: f64,

    /// Opaque tag used by external memory accounting (default: "default")
    pub tag: &'static str,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024, // 1MB
            max_small_block_ratio: 0.25,
            tag: "default",
        }
    }
}

impl PoolConfig {
    /// Set the chunk size
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// Set the small-block ratio
    pub fn max_small_block_ratio(mut self, ratio: f64) -> Self {
        self.max_small_block_ratio = ratio;
        self
    }

    /// Set the accounting tag
    pub fn tag(mut self, tag: &'static str) -> Self {
        self.tag = tag;
        self
    }

    /// Largest allocation still served by the bump cursor.
    pub fn max_small_block_size(&self) -> usize {
        (self.chunk_size as f64 * self.max_small_block_ratio.clamp(0.0, 0.5)) as usize
    }
}

/// Configuration for the block store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum total payload bytes held resident in the cache (default: 256MB)
    pub cache_capacity: usize,

    /// Block size used by file-backed chunk readers (default: 64KB)
    pub block_size: usize,

    /// Pool configuration used by write paths that assemble blocks
    pub pool: PoolConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256 * 1024 * 1024, // 256MB
            block_size: 64 * 1024,             // 64KB
            pool: PoolConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Set the resident cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Set the block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Configure the write-path pool
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.cache_capacity, 256 * 1024 * 1024);
        assert_eq!(config.block_size, 64 * 1024);

        // Test default pool config
        assert_eq!(config.pool.chunk_size, 1024 * 1024);
        assert_eq!(config.pool.max_small_block_size(), 256 * 1024);
        assert_eq!(config.pool.tag, "default");
    }

    #[test]
    fn test_config_builder() {
        let config = StoreConfig::default()
            .cache_capacity(8 * 1024 * 1024)
            .block_size(4096)
            .pool(
                PoolConfig::default()
                    .chunk_size(64 * 1024)
                    .max_small_block_ratio(0.5)
                    .tag("test"),
            );

        assert_eq!(config.cache_capacity, 8 * 1024 * 1024);
        assert_eq!(config.block_size, 4096);

        assert_eq!(config.pool.chunk_size, 64 * 1024);
        assert_eq!(config.pool.max_small_block_size(), 32 * 1024);
        assert_eq!(config.pool.tag, "test");
    }

    #[test]
    fn test_small_block_ratio_is_clamped() {
        // A ratio above 0.5 would let a "small" block overflow a fresh chunk.
        let config = PoolConfig::default().chunk_size(1000).max_small_block_ratio(0.9);
        assert_eq!(config.max_small_block_size(), 500);
    }
}

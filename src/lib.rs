pub mod arena;
pub mod config;
pub mod error;
pub mod hasher;
pub mod queue;
pub mod store;

pub use arena::ChunkedPool;
pub use config::{PoolConfig, StoreConfig};
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use queue::{PersistentQueue, PersistentQueueSnapshot};
pub use store::{
    BlockBuilder, BlockId, BlockReader, BlockStore, CacheStats, CachedBlock, FileChunkReader,
    SharedRef,
};

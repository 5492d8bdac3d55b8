pub mod block;
pub mod builder;
pub mod cache;
pub mod reader;
mod store;

pub use block::{BlockId, CachedBlock, SharedRef};
pub use builder::BlockBuilder;
pub use cache::CacheStats;
pub use reader::{BlockReader, FileChunkReader};
pub use store::BlockStore;

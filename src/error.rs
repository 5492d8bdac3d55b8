use std::io;
use std::sync::Arc;

use crate::store::BlockId;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors are cloneable so that a single fetch failure can be fanned out
/// to every subscriber waiting on the same block.
#[derive(Debug, Clone)]
pub enum Error {
    InvalidAlignment(usize),
    EmptyQueue,
    BlockFetch { id: BlockId, reason: String },
    ChecksumMismatch,
    IoError(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(Arc::new(err))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidAlignment(align) => {
                write!(f, "Alignment must be a power of two, got {}", align)
            }
            Error::EmptyQueue => write!(f, "Dequeue on an empty queue"),
            Error::BlockFetch { id, reason } => {
                write!(f, "Failed to fetch block {}: {}", id, reason)
            }
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::IoError(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

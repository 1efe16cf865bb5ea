#![forbid(unsafe_code)]

use thiserror::Error;

/// Result type used by `kinema-storage`.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors produced by storage primitives.
///
/// Higher-level crates wrap this to add domain context (cache key, URL).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk error: {0}")]
    Disk(#[from] random_access_storage::RandomAccessError),

    #[error("invalid range: start {start} >= end {end}")]
    InvalidRange { start: u64, end: u64 },

    /// The requested range is not (yet) durably cached.
    ///
    /// Control-flow signal: callers either check coverage first or treat
    /// this as "wait and retry". Never surfaced to subscribers directly.
    #[error("range [{start}, {end}) not cached")]
    NotCached { start: u64, end: u64 },

    #[error("resource sealed, writes rejected")]
    Sealed,

    #[error("resource failed: {0}")]
    Failed(String),

    #[error("operation cancelled")]
    Cancelled,
}

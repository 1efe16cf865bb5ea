#![forbid(unsafe_code)]

use kinema_core::CacheKey;
use kinema_storage::StorageError;
use thiserror::Error;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("state error: {0}")]
    Json(#[from] serde_json::Error),

    /// Index/data mismatch. Triggers a cold reset of the affected key
    /// rather than a crash.
    #[error("cache corrupt: {0}")]
    Corrupt(String),

    /// The requested range is not (yet) fully covered. Internal
    /// control-flow signal; callers translate it into "buffering".
    #[error("range [{start}, {end}) not cached")]
    NotCached { start: u64, end: u64 },

    /// Remote resource length differs from the recorded one.
    #[error("length mismatch: recorded {recorded}, remote {remote}")]
    LengthMismatch { recorded: u64, remote: u64 },

    /// Eviction refused: the key has a live session.
    #[error("session active for {0}")]
    SessionActive(CacheKey),

    #[error("cache full: cannot free enough space")]
    CacheFull,
}

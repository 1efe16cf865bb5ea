#![forbid(unsafe_code)]

use kinema_cache::CacheError;
use kinema_net::NetError;
use thiserror::Error;

pub type FetchResult<T> = Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Net(#[from] NetError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// The ranged response body ended before the requested range did.
    #[error("short body: got {got} of [{start}, {end})")]
    ShortBody { start: u64, end: u64, got: u64 },
}

impl FetchError {
    /// Transient errors are retried with backoff; the rest surface as
    /// terminal task failures.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Net(e) => e.is_retryable(),
            FetchError::Cache(_) => false,
            FetchError::ShortBody { .. } => true,
        }
    }
}

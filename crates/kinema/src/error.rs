#![forbid(unsafe_code)]

use kinema_cache::CacheError;
use kinema_core::CoreError;
use kinema_net::NetError;
use thiserror::Error;
use url::Url;

pub type PlayerResult<T> = Result<T, PlayerError>;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("key error: {0}")]
    Core(#[from] CoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// The download-on-miss policy hook denied fetching this URL.
    #[error("download declined for {0}")]
    DownloadDeclined(Url),

    /// The requested range is not buffered yet; check
    /// [`readiness`](crate::SessionHandle::readiness) before reading.
    #[error("range [{start}, {end}) not ready")]
    NotReady { start: u64, end: u64 },

    #[error("session stopped")]
    SessionStopped,
}

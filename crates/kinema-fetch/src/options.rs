#![forbid(unsafe_code)]

use kinema_net::RetryPolicy;

/// Fetcher configuration.
#[derive(Clone, Debug)]
pub struct FetchOptions {
    /// Cap for a single background gap-fill request.
    pub chunk_size: u64,
    /// Window ahead of the cursor that background planning serves first;
    /// also the threshold past which a forward seek supersedes pending
    /// tasks behind it.
    pub lookahead: u64,
    /// Backoff schedule for transient network failures.
    pub retry: RetryPolicy,
    /// Start with scheduling suspended; a `resume()` call begins work.
    pub start_paused: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024,
            lookahead: 2 * 1024 * 1024,
            retry: RetryPolicy::default(),
            start_paused: false,
        }
    }
}

impl FetchOptions {
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_lookahead(mut self, lookahead: u64) -> Self {
        self.lookahead = lookahead;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_start_paused(mut self, start_paused: bool) -> Self {
        self.start_paused = start_paused;
        self
    }
}

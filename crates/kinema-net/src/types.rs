#![forbid(unsafe_code)]

use std::{cmp::min, collections::HashMap, time::Duration};

/// Case-preserving header map for requests and HEAD responses.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    inner: HashMap<String, String>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn insert<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.inner.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Parse `Content-Length` (either spelling), the length probe used
    /// before opening a cache session.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")
            .or_else(|| self.get("Content-Length"))
            .and_then(|v| v.trim().parse::<u64>().ok())
    }
}

impl From<HashMap<String, String>> for Headers {
    fn from(map: HashMap<String, String>) -> Self {
        Self { inner: map }
    }
}

/// Byte-range request, inclusive end per the HTTP `Range` grammar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeSpec {
    #[must_use]
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Build a spec for a half-open `[start, end)` range.
    #[must_use]
    pub fn from_range(range: std::ops::Range<u64>) -> Self {
        Self {
            start: range.start,
            end: Some(range.end.saturating_sub(1)),
        }
    }

    #[must_use]
    pub fn to_header_value(&self) -> String {
        if let Some(end) = self.end {
            format!("bytes={}-{}", self.start, end)
        } else {
            format!("bytes={}-", self.start)
        }
    }
}

/// Bounded exponential backoff schedule for transient failures.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Zero for the first attempt, then doubling from `base_delay`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponential = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)));
        min(exponential, self.max_delay)
    }
}

/// Network configuration.
#[derive(Clone, Debug)]
pub struct NetOptions {
    /// Timeout for unary requests (HEAD). Streaming bodies are not
    /// timed out; downloads take arbitrary time.
    pub request_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Max idle connections per host. 0 disables pooling.
    pub pool_max_idle_per_host: usize,
}

impl Default for NetOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            pool_max_idle_per_host: 2,
        }
    }
}

impl NetOptions {
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

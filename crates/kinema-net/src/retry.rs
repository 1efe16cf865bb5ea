#![forbid(unsafe_code)]

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;
use url::Url;

use crate::{
    error::NetError,
    traits::{ByteStream, Net},
    types::{Headers, RangeSpec, RetryPolicy},
};

/// Retry decorator for [`Net`] implementations.
///
/// Retries transient errors ([`NetError::is_retryable`]) up to
/// `policy.max_retries` times with exponential backoff. Non-retryable
/// errors pass through immediately.
#[derive(Clone, Debug)]
pub struct RetryNet<N> {
    inner: N,
    policy: RetryPolicy,
}

impl<N: Net> RetryNet<N> {
    pub fn new(inner: N, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn exhausted(&self, last_error: Option<NetError>) -> NetError {
        NetError::RetryExhausted {
            max_retries: self.policy.max_retries,
            source: Box::new(last_error.unwrap_or(NetError::Timeout)),
        }
    }
}

#[async_trait]
impl<N: Net> Net for RetryNet<N> {
    async fn head(&self, url: Url, headers: Option<Headers>) -> Result<Headers, NetError> {
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            match self.inner.head(url.clone(), headers.clone()).await {
                Ok(out) => return Ok(out),
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    debug!(attempt, %error, "transient error on head, will retry");
                    last_error = Some(error);

                    if attempt < self.policy.max_retries {
                        sleep(self.policy.delay_for_attempt(attempt + 1)).await;
                    }
                }
            }
        }

        Err(self.exhausted(last_error))
    }

    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<ByteStream, NetError> {
        let mut last_error = None;

        for attempt in 0..=self.policy.max_retries {
            match self
                .inner
                .get_range(url.clone(), range.clone(), headers.clone())
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    debug!(attempt, %error, "transient error on range request, will retry");
                    last_error = Some(error);

                    if attempt < self.policy.max_retries {
                        sleep(self.policy.delay_for_attempt(attempt + 1)).await;
                    }
                }
            }
        }

        Err(self.exhausted(last_error))
    }
}

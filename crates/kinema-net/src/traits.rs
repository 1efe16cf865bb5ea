#![forbid(unsafe_code)]

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use url::Url;

use crate::{
    error::NetError,
    retry::RetryNet,
    types::{Headers, RangeSpec, RetryPolicy},
};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, NetError>> + Send>>;

#[cfg_attr(test, unimock::unimock(api = NetMock))]
#[async_trait]
pub trait Net: Send + Sync {
    /// HEAD probe, used to learn the resource length before caching.
    async fn head(&self, url: Url, headers: Option<Headers>) -> Result<Headers, NetError>;

    /// Stream a byte range from a URL.
    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<ByteStream, NetError>;
}

pub trait NetExt: Net + Sized {
    /// Add a retry layer.
    fn with_retry(self, policy: RetryPolicy) -> RetryNet<Self> {
        RetryNet::new(self, policy)
    }
}

impl<T: Net> NetExt for T {}

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client;
use tracing::trace;
use url::Url;

use crate::{
    error::NetError,
    traits::{ByteStream, Net},
    types::{Headers, NetOptions, RangeSpec},
};

/// HTTP client backed by reqwest.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: Client,
    options: NetOptions,
}

impl HttpClient {
    /// # Panics
    ///
    /// Panics if the `reqwest::Client` builder fails to build.
    #[must_use]
    pub fn new(options: NetOptions) -> Self {
        let inner = Client::builder()
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .build()
            .expect("failed to build reqwest client");
        Self { inner, options }
    }

    #[must_use]
    pub fn options(&self) -> &NetOptions {
        &self.options
    }

    fn apply_headers(
        mut req: reqwest::RequestBuilder,
        headers: Option<Headers>,
    ) -> reqwest::RequestBuilder {
        if let Some(headers) = headers {
            for (k, v) in headers.iter() {
                req = req.header(k, v);
            }
        }
        req
    }
}

#[async_trait]
impl Net for HttpClient {
    async fn head(&self, url: Url, headers: Option<Headers>) -> Result<Headers, NetError> {
        let req = self.inner.head(url.clone());
        let req = Self::apply_headers(req, headers);
        let req = req.timeout(self.options.request_timeout);

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();

        if !status.is_success() {
            return Err(NetError::http_status(status.as_u16(), url.to_string()));
        }

        let mut out = Headers::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                out.insert(name.as_str(), v);
            }
        }
        Ok(out)
    }

    async fn get_range(
        &self,
        url: Url,
        range: RangeSpec,
        headers: Option<Headers>,
    ) -> Result<ByteStream, NetError> {
        trace!(url = %url, range = %range.to_header_value(), "range request");

        let mut req = self
            .inner
            .get(url.clone())
            .header("Range", range.to_header_value());
        req = Self::apply_headers(req, headers);
        // No timeout on the body; range downloads take arbitrary time.

        let resp = req.send().await.map_err(NetError::from)?;
        let status = resp.status();

        if !(status.is_success() || status.as_u16() == 206) {
            return Err(NetError::http_status(status.as_u16(), url.to_string()));
        }

        // A plain 200 means the server ignored Range and is serving the
        // whole body from offset 0. Only acceptable when that is what
        // was asked for: writing it at a nonzero offset would corrupt
        // the cache.
        if status.as_u16() == 200 && range.start > 0 {
            return Err(NetError::InvalidRange(format!(
                "server ignored range request at offset {}",
                range.start
            )));
        }

        let stream = resp.bytes_stream().map_err(NetError::from);
        Ok(Box::pin(stream))
    }
}

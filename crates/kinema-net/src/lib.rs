#![forbid(unsafe_code)]

//! HTTP range client for kinema.
//!
//! [`HttpClient`] issues HEAD probes and `Range` requests; [`RetryNet`]
//! wraps any [`Net`] with bounded exponential-backoff retries for
//! transient failures ([`NetError::is_retryable`]).

mod client;
mod error;
mod retry;
mod traits;
mod types;

pub use crate::{
    client::HttpClient,
    error::{NetError, NetResult},
    retry::RetryNet,
    traits::{ByteStream, Net, NetExt},
    types::{Headers, NetOptions, RangeSpec, RetryPolicy},
};

#![forbid(unsafe_code)]

//! Prioritized byte-range fetching for kinema.
//!
//! A [`RangeFetcher`] owns one background worker per cache session. The
//! worker serializes network fetches for the key (one active download at
//! a time), writes every received chunk through the cache session before
//! publishing coverage, and plans background gap-filling toward the
//! playback cursor when no explicit requests are queued.
//!
//! Dedup invariant: the same byte never travels the network twice
//! concurrently for one key: requests overlapping the active download
//! subscribe to it instead of refetching.

mod error;
mod events;
mod fetcher;
mod options;
mod task;

pub use error::{FetchError, FetchResult};
pub use events::FetchEvent;
pub use fetcher::RangeFetcher;
pub use options::FetchOptions;
pub use task::{FetchPriority, TaskHandle, TaskState};

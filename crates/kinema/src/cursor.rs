#![forbid(unsafe_code)]

use std::{
    fmt,
    ops::Range,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use kinema_cache::CacheSession;
use kinema_fetch::{FetchPriority, RangeFetcher};
use tracing::trace;

use crate::events::CacheType;

/// Whether the renderer may read at the current position.
#[derive(Clone, Debug, PartialEq)]
pub enum Readiness {
    /// The lookahead window is fully covered; reads will not block.
    Ready(CacheType),
    /// Data is still arriving; carries the completion fraction.
    Buffering(f64),
    /// The fetcher reported a terminal failure for the needed range.
    Error(String),
}

/// Tracks the renderer's read position and drives the fetcher toward it.
///
/// The renderer advances the cursor as it consumes bytes (monotonic) or
/// jumps it on seeks (arbitrary). Readiness is derived from the fragment
/// index: `Ready` only when `[offset, offset+lookahead)`, clamped to
/// the total size, is durably cached.
pub struct PlaybackCursor {
    cache: Arc<CacheSession>,
    fetcher: RangeFetcher,
    lookahead: u64,
    offset: AtomicU64,
    /// Session joined a live one; reads come from its warm state.
    joined: bool,
    failed: Mutex<Option<String>>,
}

impl fmt::Debug for PlaybackCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackCursor")
            .field("offset", &self.offset.load(Ordering::Acquire))
            .field("lookahead", &self.lookahead)
            .finish_non_exhaustive()
    }
}

impl PlaybackCursor {
    pub(crate) fn new(
        cache: Arc<CacheSession>,
        fetcher: RangeFetcher,
        lookahead: u64,
        joined: bool,
    ) -> Self {
        Self {
            cache,
            fetcher,
            lookahead,
            offset: AtomicU64::new(0),
            joined,
            failed: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Move the read position; called by the renderer as it consumes
    /// bytes or seeks.
    ///
    /// Reprioritizes the fetcher toward the new position and requests
    /// any gap in the lookahead window urgently.
    pub fn advance_to(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
        self.fetcher.set_cursor(offset);

        let window = self.window(offset);
        if !window.is_empty() && !self.cache.is_fully_covered(window.clone()) {
            trace!(?window, "requesting cursor window");
            let _ = self
                .fetcher
                .request_range(window, FetchPriority::Urgent);
        }
    }

    /// Current readiness of the lookahead window.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        if let Some(error) = self.failed.lock().expect("cursor failure lock").clone() {
            return Readiness::Error(error);
        }

        let window = self.window(self.offset());
        if self.cache.is_fully_covered(window) {
            Readiness::Ready(self.cache_type())
        } else {
            Readiness::Buffering(self.cache.fraction_complete())
        }
    }

    pub(crate) fn cache_type(&self) -> CacheType {
        if self.joined {
            CacheType::Memory
        } else if self.cache.is_complete() {
            CacheType::Disk
        } else {
            CacheType::WebFetching
        }
    }

    pub(crate) fn record_failure(&self, error: String) {
        let mut failed = self.failed.lock().expect("cursor failure lock");
        // First failure wins; it already surfaced to subscribers.
        failed.get_or_insert(error);
    }

    /// Lookahead window at `offset`, clamped to the total size when
    /// known. Empty at/after EOF.
    fn window(&self, offset: u64) -> Range<u64> {
        let end = offset.saturating_add(self.lookahead);
        match self.cache.total_expected_size() {
            Some(total) => offset.min(total)..end.min(total),
            None => offset..end,
        }
    }
}

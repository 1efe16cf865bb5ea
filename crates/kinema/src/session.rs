#![forbid(unsafe_code)]

use std::{
    fmt,
    ops::Range,
    sync::{Arc, Mutex, Weak},
};

use bytes::Bytes;
use kinema_cache::{CacheError, CacheSession};
use kinema_core::CacheKey;
use kinema_fetch::{FetchEvent, RangeFetcher};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::{
    PlayerError, PlayerResult,
    cursor::{PlaybackCursor, Readiness},
    events::{CacheType, EventDispatcher, PlayerEvent},
    hooks::PolicyHooks,
    status::PlayerStatus,
};

/// Shared state behind every [`SessionHandle`] clone for one key.
pub(crate) struct SessionCore {
    pub(crate) url: Url,
    pub(crate) key: CacheKey,
    pub(crate) cache: Arc<CacheSession>,
    pub(crate) fetcher: RangeFetcher,
    pub(crate) cursor: PlaybackCursor,
    pub(crate) cancel: CancellationToken,
    pub(crate) events: EventDispatcher,
    pub(crate) status: Mutex<PlayerStatus>,
    pub(crate) auto_replay: bool,
    pub(crate) joined: bool,
    pub(crate) hooks: PolicyHooks,
}

impl SessionCore {
    pub(crate) fn status(&self) -> PlayerStatus {
        *self.status.lock().expect("status lock")
    }

    pub(crate) fn set_status(&self, next: PlayerStatus) {
        let mut status = self.status.lock().expect("status lock");
        if *status == next {
            return;
        }
        if !status.may_transition_to(next) {
            warn!(from = ?*status, to = ?next, "illegal status transition ignored");
            return;
        }
        let from = *status;
        *status = next;
        drop(status);

        debug!(?from, to = ?next, key = %self.key, "status changed");
        self.events
            .publish(PlayerEvent::StatusChanged { status: next });
    }

    /// Re-derive status from cursor readiness; returns the readiness.
    ///
    /// `Paused` and `Stopped` hold until an explicit resume/never;
    /// reaching the end of a sized resource transitions to `Finished`
    /// (or restarts when auto-replay is permitted).
    pub(crate) fn refresh_status(&self) -> Readiness {
        let readiness = self.cursor.readiness();
        let current = self.status();

        if current == PlayerStatus::Stopped || current == PlayerStatus::Paused {
            return readiness;
        }

        if let Readiness::Error(_) = &readiness {
            self.set_status(PlayerStatus::Stopped);
            return readiness;
        }

        if let Some(total) = self.cache.total_expected_size() {
            if total > 0 && self.cursor.offset() >= total {
                if current != PlayerStatus::Finished {
                    self.set_status(PlayerStatus::Finished);
                    if self.auto_replay && self.hooks.auto_replay_permitted(&self.url) {
                        debug!(key = %self.key, "auto-replay");
                        self.cursor.advance_to(0);
                        self.set_status(PlayerStatus::Buffering);
                        let restarted = self.cursor.readiness();
                        if matches!(restarted, Readiness::Ready(_)) {
                            self.set_status(PlayerStatus::Playing);
                        }
                        return restarted;
                    }
                }
                return readiness;
            }
        }

        match (&readiness, current) {
            (
                Readiness::Ready(_),
                PlayerStatus::Idle | PlayerStatus::Buffering | PlayerStatus::Finished,
            ) => {
                self.set_status(PlayerStatus::Playing);
            }
            (
                Readiness::Buffering(_),
                PlayerStatus::Idle | PlayerStatus::Playing | PlayerStatus::Finished,
            ) => {
                self.set_status(PlayerStatus::Buffering);
            }
            _ => {}
        }

        readiness
    }

    pub(crate) fn current_cache_type(&self) -> CacheType {
        if !self.joined && !self.cache.is_complete() && self.cache.covered_ranges().is_empty() {
            CacheType::None
        } else {
            self.cursor.cache_type()
        }
    }

    pub(crate) fn emit_download_progress(&self, error: Option<String>) {
        self.events.publish(PlayerEvent::DownloadProgress {
            cache_type: self.current_cache_type(),
            covered_ranges: self.cache.covered_ranges(),
            expected_size: self.cache.total_expected_size(),
            error,
        });
    }

    pub(crate) fn on_fetch_event(&self, event: FetchEvent) {
        match event {
            FetchEvent::TaskStarted { .. } | FetchEvent::Idle => {}
            FetchEvent::Progress { .. }
            | FetchEvent::TaskCompleted { .. }
            | FetchEvent::DownloadComplete { .. } => {
                self.emit_download_progress(None);
                self.refresh_status();
            }
            FetchEvent::TaskFailed {
                error, terminal, ..
            } => {
                if terminal {
                    self.cursor.record_failure(error.clone());
                    self.emit_download_progress(Some(error));
                    self.set_status(PlayerStatus::Stopped);
                }
            }
        }
    }

    pub(crate) fn pause(&self) {
        self.fetcher.pause();
        if matches!(
            self.status(),
            PlayerStatus::Playing | PlayerStatus::Buffering
        ) {
            self.set_status(PlayerStatus::Paused);
        }
    }

    pub(crate) fn resume(&self) {
        self.fetcher.resume();
        if self.status() == PlayerStatus::Paused {
            self.set_status(PlayerStatus::Buffering);
            self.refresh_status();
        }
    }

    pub(crate) fn stop(&self) {
        self.fetcher.stop();
        if let Err(e) = self.cache.flush_index() {
            warn!(error = %e, "index flush on stop failed");
        }
        self.set_status(PlayerStatus::Stopped);
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        // No handles left, so nobody is reading: stop scheduling and
        // abort the in-flight transfer. The on-disk cache survives.
        self.fetcher.stop();
        self.cancel.cancel();
    }
}

/// Forward fetch-worker events into the session's delivery channel.
///
/// Holds only a weak reference so a parked worker cannot keep the
/// session alive after the last handle is gone.
pub(crate) fn spawn_forwarder(
    core: Weak<SessionCore>,
    mut rx: mpsc::UnboundedReceiver<FetchEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Some(core) = core.upgrade() else { return };
            core.on_fetch_event(event);
        }
    });
}

/// Handle to one playback session.
///
/// Clones share the session; the renderer collaborator drives playback
/// through [`advance_to`](Self::advance_to)/[`read`](Self::read), and
/// subscribers receive ordered [`PlayerEvent`]s. Dropping the last
/// handle tears the session down (the disk cache survives for reuse).
#[derive(Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("url", &self.core.url.as_str())
            .field("key", &self.core.key)
            .field("status", &self.core.status())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub(crate) fn from_core(core: Arc<SessionCore>) -> Self {
        Self { core }
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.core.url
    }

    #[must_use]
    pub fn cache_key(&self) -> CacheKey {
        self.core.key
    }

    #[must_use]
    pub fn status(&self) -> PlayerStatus {
        self.core.status()
    }

    /// Subscribe to this session's ordered event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.core.events.subscribe()
    }

    /// Read a byte range. Only valid when readiness reports `Ready`.
    ///
    /// # Errors
    ///
    /// [`PlayerError::NotReady`] when the range is not buffered yet
    /// (readiness flips to `Buffering`, never a subscriber error);
    /// [`PlayerError::SessionStopped`] after a stop.
    pub async fn read(&self, range: Range<u64>) -> PlayerResult<Bytes> {
        if self.core.status() == PlayerStatus::Stopped {
            return Err(PlayerError::SessionStopped);
        }
        match self.core.cache.read(range).await {
            Ok(bytes) => Ok(bytes),
            Err(CacheError::NotCached { start, end }) => {
                self.core.refresh_status();
                Err(PlayerError::NotReady { start, end })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until a range becomes readable (local disk or in-flight
    /// fetch; resolves `Err` on failure or cancellation).
    ///
    /// # Errors
    ///
    /// Propagates storage failure or cancellation.
    pub async fn wait_range(&self, range: Range<u64>) -> PlayerResult<()> {
        self.core.cache.wait_range(range).await?;
        Ok(())
    }

    /// Report playback position; called by the renderer as it consumes
    /// bytes (or seeks). Drives fetch prioritization and readiness.
    pub fn advance_to(&self, offset: u64) {
        self.core.cursor.advance_to(offset);
        self.core.refresh_status();
    }

    /// Current readiness of the lookahead window at the cursor.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        self.core.refresh_status()
    }

    #[must_use]
    pub fn covered_ranges(&self) -> Vec<Range<u64>> {
        self.core.cache.covered_ranges()
    }

    #[must_use]
    pub fn total_expected_size(&self) -> Option<u64> {
        self.core.cache.total_expected_size()
    }

    #[must_use]
    pub fn fraction_complete(&self) -> f64 {
        self.core.cache.fraction_complete()
    }

    /// Republish the renderer's playback clock to subscribers.
    pub fn report_playback_clock(&self, elapsed_seconds: f64, total_seconds: f64) {
        self.core.events.publish(PlayerEvent::PlayProgress {
            elapsed_seconds,
            total_seconds,
            error: None,
        });
    }

    /// Suspend fetch scheduling and playback status.
    pub fn pause(&self) {
        self.core.pause();
    }

    pub fn resume(&self) {
        self.core.resume();
    }

    /// Stop playback: pending fetches cancel immediately, the in-flight
    /// one completes, the index is flushed. The cached bytes survive.
    pub fn stop(&self) {
        self.core.stop();
    }
}

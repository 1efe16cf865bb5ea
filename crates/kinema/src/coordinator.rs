#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use kinema_cache::{DiskCacheStore, OpenKind};
use kinema_core::{CacheKey, KeyRule};
use kinema_fetch::{FetchOptions, RangeFetcher};
use kinema_net::{HttpClient, Net};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    PlayerError, PlayerResult,
    cursor::PlaybackCursor,
    events::{CacheType, EventDispatcher, PlayerEvent},
    hooks::PolicyHooks,
    options::{CoordinatorOptions, PlayOptions},
    session::{SessionCore, SessionHandle, spawn_forwarder},
    status::PlayerStatus,
};

/// Top-level orchestrator: one active session per URL, wiring the disk
/// cache, range fetcher and playback cursor together.
///
/// Construct one per process (or per cache root) and pass it by
/// reference. It is the explicit registry that replaces any hidden
/// shared instance.
pub struct PlaybackCoordinator {
    store: Arc<DiskCacheStore>,
    net: HttpClient,
    fetch_options: FetchOptions,
    hooks: PolicyHooks,
    key_rule: Arc<dyn KeyRule>,
    events_capacity: usize,
    sessions: DashMap<CacheKey, Weak<SessionCore>>,
}

impl std::fmt::Debug for PlaybackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackCoordinator")
            .field("root", &self.store.root())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl PlaybackCoordinator {
    /// Open the cache store and build the coordinator.
    ///
    /// # Errors
    ///
    /// Propagates cache-store open failures.
    pub fn new(options: CoordinatorOptions) -> PlayerResult<Self> {
        let store = DiskCacheStore::open(options.store)?;
        info!(root = %store.root().display(), "playback coordinator ready");
        Ok(Self {
            store,
            net: HttpClient::new(options.net),
            fetch_options: options.fetch,
            hooks: options.hooks,
            key_rule: options.key_rule,
            events_capacity: options.events_capacity,
            sessions: DashMap::new(),
        })
    }

    /// Cache key for a URL under the configured rule. Pure; lets callers
    /// pre-check cache presence without starting playback.
    ///
    /// # Errors
    ///
    /// Propagates canonicalization failures for scheme-/host-less URLs.
    pub fn cache_key_for(&self, url: &Url) -> PlayerResult<CacheKey> {
        Ok(CacheKey::from_url_with(&*self.key_rule, url)?)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<DiskCacheStore> {
        &self.store
    }

    /// Play `url`, reusing cached ranges for its key.
    ///
    /// Opens (or joins) the cache session, starts the fetcher, and
    /// returns the handle the renderer drives. Concurrent plays of the
    /// same key share one session.
    ///
    /// # Errors
    ///
    /// [`PlayerError::DownloadDeclined`] when the policy hook vetoes
    /// fetching an uncached URL; [`PlayerError::Net`] when the resource
    /// is unreachable and nothing is cached; cache errors otherwise.
    pub async fn play(&self, url: Url, options: PlayOptions) -> PlayerResult<SessionHandle> {
        let key = self.cache_key_for(&url)?;

        if let Some(core) = self.sessions.get(&key).and_then(|weak| weak.upgrade()) {
            debug!(%key, "joining live playback session");
            core.events.publish(PlayerEvent::DownloadProgress {
                cache_type: CacheType::Memory,
                covered_ranges: core.cache.covered_ranges(),
                expected_size: core.cache.total_expected_size(),
                error: None,
            });
            return Ok(SessionHandle::from_core(core));
        }

        if !options.use_cache_if_present {
            if let Err(e) = self.store.evict(&key) {
                debug!(%key, error = %e, "pre-play evict skipped");
            }
        }

        // Length probe. Failure is tolerated when the key is cached:
        // playback can run offline from disk.
        let (remote_len, head_error) = match self.net.head(url.clone(), None).await {
            Ok(headers) => (headers.content_length(), None),
            Err(e) => {
                warn!(%url, error = %e, "length probe failed");
                (None, Some(e))
            }
        };

        let cancel = CancellationToken::new();
        let open = self
            .store
            .open_or_create(key, remote_len, cancel.clone())
            .await?;
        let session = open.session;
        let joined = open.kind == OpenKind::Joined;
        let complete = session.is_complete();
        let cache_miss = session.covered_ranges().is_empty();

        if let Some(err) = head_error {
            if cache_miss {
                return Err(PlayerError::Net(err));
            }
        }

        let consult = !complete && (cache_miss || options.require_download_confirmation);
        if consult && !self.hooks.download_permitted(&url) {
            info!(%url, "download declined by policy");
            return Err(PlayerError::DownloadDeclined(url));
        }

        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let fetcher = RangeFetcher::spawn(
            Arc::clone(&session),
            self.net.clone(),
            url.clone(),
            self.fetch_options.clone(),
            fetch_tx,
            cancel.clone(),
        );
        let cursor = PlaybackCursor::new(
            Arc::clone(&session),
            fetcher.clone(),
            options.lookahead,
            joined,
        );

        let core = Arc::new(SessionCore {
            url,
            key,
            cache: session,
            fetcher,
            cursor,
            cancel,
            events: EventDispatcher::new(self.events_capacity),
            status: Mutex::new(PlayerStatus::Idle),
            auto_replay: options.auto_replay,
            joined,
            hooks: self.hooks.clone(),
        });

        spawn_forwarder(Arc::downgrade(&core), fetch_rx);
        self.sessions.insert(key, Arc::downgrade(&core));

        if let Some(total) = core.cache.total_expected_size() {
            core.events.publish(PlayerEvent::FileLength { bytes: total });
        }
        core.emit_download_progress(None);
        core.set_status(PlayerStatus::Buffering);
        core.refresh_status();

        Ok(SessionHandle::from_core(core))
    }

    pub fn pause(&self, session: &SessionHandle) {
        session.pause();
    }

    pub fn resume(&self, session: &SessionHandle) {
        session.resume();
    }

    pub fn stop(&self, session: &SessionHandle) {
        session.stop();
        self.sessions.remove(&session.cache_key());
    }

    #[must_use]
    pub fn subscribe(&self, session: &SessionHandle) -> broadcast::Receiver<PlayerEvent> {
        session.subscribe()
    }

    /// Host lifecycle pause signal: suspend every live session whose
    /// URL the pause policy applies to.
    pub fn on_pause(&self) {
        self.for_each_live(|core| {
            if core.hooks.lifecycle_pause_applies(&core.url) {
                core.pause();
            }
        });
    }

    /// Host lifecycle resume signal, vetoed per URL like `on_pause`.
    pub fn on_resume(&self) {
        self.for_each_live(|core| {
            if core.hooks.lifecycle_resume_applies(&core.url) {
                core.resume();
            }
        });
    }

    /// Evict a key's cached bytes. Refused while a session is live.
    ///
    /// # Errors
    ///
    /// [`kinema_cache::CacheError::SessionActive`] via
    /// [`PlayerError::Cache`] when the key is in use.
    pub fn evict(&self, key: &CacheKey) -> PlayerResult<()> {
        Ok(self.store.evict(key)?)
    }

    fn for_each_live(&self, f: impl Fn(&SessionCore)) {
        for entry in &self.sessions {
            if let Some(core) = entry.value().upgrade() {
                f(&core);
            }
        }
    }
}

#![forbid(unsafe_code)]

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use kinema_core::CacheKey;
use kinema_storage::{CacheFile, CacheFileOptions, FragmentIndex};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    CacheError, CacheResult,
    record::{DATA_FILE, IndexRecord},
    session::CacheSession,
};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    pub root_dir: PathBuf,
    /// Aggregate cache budget across all keys.
    pub max_bytes: u64,
}

impl StoreOptions {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            max_bytes: 4 * 1024 * 1024 * 1024,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreState {
    total_bytes: u64,
    entries: HashMap<String, EntryState>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct EntryState {
    size_bytes: u64,
    created_ms: u64,
    /// Stamped when the key's download completed; eviction order key.
    last_completed_ms: Option<u64>,
}

/// How a [`CacheSession`] came to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenKind {
    /// No prior data for the key.
    Created,
    /// Prior data reloaded from disk.
    Resumed { complete: bool },
    /// An already-live session for the key was joined.
    Joined,
}

/// Result of [`DiskCacheStore::open_or_create`].
#[derive(Debug)]
pub struct SessionOpen {
    pub session: Arc<CacheSession>,
    pub kind: OpenKind,
}

#[derive(Clone, Debug)]
pub struct CacheStats {
    pub total_bytes: u64,
    pub entry_count: usize,
    pub live_sessions: usize,
}

/// Durable byte storage addressed by `(key, offset)` plus sidecar
/// fragment-index persistence and LRU-by-completion eviction.
#[derive(Debug)]
pub struct DiskCacheStore {
    root: PathBuf,
    max_bytes: u64,
    /// Aggregate cached bytes; the only state shared across keys.
    total_bytes: AtomicU64,
    state: Mutex<StoreState>,
    live: DashMap<String, Weak<CacheSession>>,
}

impl DiskCacheStore {
    /// Open the store root, loading prior accounting state if present.
    /// A corrupt `state.json` degrades to empty accounting.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`] when the root cannot be created or
    /// `state.json` cannot be read.
    pub fn open(opts: StoreOptions) -> CacheResult<Arc<Self>> {
        std::fs::create_dir_all(&opts.root_dir)?;
        let state = Self::load_state(&opts.root_dir)?;
        let total = state.total_bytes;

        info!(root = %opts.root_dir.display(), total_bytes = total, "cache store opened");

        Ok(Arc::new(Self {
            root: opts.root_dir,
            max_bytes: opts.max_bytes,
            total_bytes: AtomicU64::new(total),
            state: Mutex::new(state),
            live: DashMap::new(),
        }))
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, hex: &str) -> PathBuf {
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Open a session for `key`, or join the live one.
    ///
    /// `remote_len`, when known, is validated against the recorded total:
    /// a mismatch resets the key's storage (self-heal) before opening.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Storage`]/[`CacheError::Io`] on disk
    /// failures while opening the backing file.
    pub async fn open_or_create(
        self: &Arc<Self>,
        key: CacheKey,
        remote_len: Option<u64>,
        cancel: CancellationToken,
    ) -> CacheResult<SessionOpen> {
        let hex = key.to_hex();

        if let Some(existing) = self.upgrade_live(&hex) {
            // A live session cannot be reset; a conflicting length has
            // to surface instead of self-healing.
            if let (Some(recorded), Some(remote)) = (existing.total_expected_size(), remote_len) {
                if recorded != remote {
                    return Err(CacheError::LengthMismatch { recorded, remote });
                }
            }
            debug!(%key, "joining live cache session");
            return Ok(SessionOpen {
                session: existing,
                kind: OpenKind::Joined,
            });
        }

        let dir = self.key_dir(&hex);
        let mut record = IndexRecord::load(&dir);

        if let Some(rec) = &record {
            if let (Some(recorded), Some(remote)) = (rec.total_expected_size(), remote_len) {
                if recorded != remote {
                    warn!(
                        %key,
                        recorded,
                        remote,
                        "recorded length differs from remote, resetting key"
                    );
                    self.reset_key(&hex)?;
                    record = None;
                }
            }
        }

        if let Some(rec) = &record {
            let data_len = std::fs::metadata(dir.join(DATA_FILE))
                .map(|m| m.len())
                .unwrap_or(0);
            if data_len < rec.covered_end() {
                warn!(
                    %key,
                    data_len,
                    covered_end = rec.covered_end(),
                    "sidecar claims more than the data blob holds, resetting key"
                );
                self.reset_key(&hex)?;
                record = None;
            }
        }

        let resumed = record.is_some();
        let mut index = record.map_or_else(FragmentIndex::new, IndexRecord::into_index);
        if index.total_expected_size().is_none() {
            if let Some(total) = remote_len {
                index.set_total_expected_size(total);
            }
        }

        let file = CacheFile::open(CacheFileOptions::new(dir.join(DATA_FILE), cancel)).await?;
        file.restore(&index.covered_ranges()).await;

        let complete = index.is_complete();
        if complete {
            file.seal(index.total_expected_size()).await?;
        }

        self.touch_entry(&hex)?;

        let session = CacheSession::new(key, dir, Arc::clone(self), file, index);

        // Another task may have created the session between the live
        // check above and here; the earlier one wins.
        use dashmap::mapref::entry::Entry;
        match self.live.entry(hex) {
            Entry::Occupied(mut occupied) => {
                if let Some(existing) = occupied.get().upgrade() {
                    return Ok(SessionOpen {
                        session: existing,
                        kind: OpenKind::Joined,
                    });
                }
                occupied.insert(Arc::downgrade(&session));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(&session));
            }
        }

        let kind = if resumed {
            OpenKind::Resumed { complete }
        } else {
            OpenKind::Created
        };

        Ok(SessionOpen { session, kind })
    }

    /// Delete all bytes and index data for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::SessionActive`] when the key has a live
    /// session; eviction never removes an active key.
    pub fn evict(&self, key: &CacheKey) -> CacheResult<()> {
        let hex = key.to_hex();
        if self.upgrade_live(&hex).is_some() {
            return Err(CacheError::SessionActive(*key));
        }
        self.reset_key(&hex)
    }

    /// Make room for `incoming` bytes, evicting least-recently-completed
    /// keys first. Live sessions are never candidates.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::CacheFull`] when the budget cannot be met.
    pub fn ensure_space(&self, incoming: u64) -> CacheResult<()> {
        let total = self.total_bytes.load(Ordering::Acquire);
        if total.saturating_add(incoming) <= self.max_bytes {
            return Ok(());
        }

        let mut candidates: Vec<(String, u64, u64)> = {
            let state = self.state.lock().expect("store state lock");
            state
                .entries
                .iter()
                .filter(|(hex, _)| self.upgrade_live(hex).is_none())
                .map(|(hex, entry)| {
                    let stamp = entry.last_completed_ms.unwrap_or(entry.created_ms);
                    (hex.clone(), stamp, entry.size_bytes)
                })
                .collect()
        };
        candidates.sort_by_key(|(_, stamp, _)| *stamp);

        for (hex, _, size) in candidates {
            if self
                .total_bytes
                .load(Ordering::Acquire)
                .saturating_add(incoming)
                <= self.max_bytes
            {
                break;
            }
            debug!(key = %hex, size, "evicting for space");
            self.reset_key(&hex)?;
        }

        if self
            .total_bytes
            .load(Ordering::Acquire)
            .saturating_add(incoming)
            > self.max_bytes
        {
            return Err(CacheError::CacheFull);
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("store state lock");
        let live_sessions = self
            .live
            .iter()
            .filter(|entry| entry.value().upgrade().is_some())
            .count();
        CacheStats {
            total_bytes: self.total_bytes.load(Ordering::Acquire),
            entry_count: state.entries.len(),
            live_sessions,
        }
    }

    /// Persist the accounting state. Called on index flush and teardown.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Io`]/[`CacheError::Json`] on write failure.
    pub fn persist_state(&self) -> CacheResult<()> {
        let mut state = self.state.lock().expect("store state lock");
        state.total_bytes = self.total_bytes.load(Ordering::Acquire);
        Self::save_state(&self.root, &state)
    }

    fn upgrade_live(&self, hex: &str) -> Option<Arc<CacheSession>> {
        self.live.get(hex).and_then(|weak| weak.upgrade())
    }

    pub(crate) fn remove_live(&self, hex: &str) {
        self.live.remove(hex);
    }

    pub(crate) fn add_bytes(&self, hex: &str, delta: u64) {
        if delta == 0 {
            return;
        }
        self.total_bytes.fetch_add(delta, Ordering::AcqRel);
        let mut state = self.state.lock().expect("store state lock");
        if let Some(entry) = state.entries.get_mut(hex) {
            entry.size_bytes += delta;
        }
    }

    pub(crate) fn mark_completed(&self, hex: &str) -> CacheResult<()> {
        {
            let mut state = self.state.lock().expect("store state lock");
            if let Some(entry) = state.entries.get_mut(hex) {
                entry.last_completed_ms = Some(now_ms());
            }
        }
        self.persist_state()
    }

    fn touch_entry(&self, hex: &str) -> CacheResult<()> {
        {
            let mut state = self.state.lock().expect("store state lock");
            state
                .entries
                .entry(hex.to_string())
                .or_insert_with(|| EntryState {
                    size_bytes: 0,
                    created_ms: now_ms(),
                    last_completed_ms: None,
                });
        }
        self.persist_state()
    }

    fn reset_key(&self, hex: &str) -> CacheResult<()> {
        let dir = self.key_dir(hex);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }

        let removed = {
            let mut state = self.state.lock().expect("store state lock");
            state
                .entries
                .remove(hex)
                .map_or(0, |entry| entry.size_bytes)
        };
        if removed > 0 {
            self.total_bytes.fetch_sub(removed, Ordering::AcqRel);
        }
        self.persist_state()
    }

    fn state_file(root: &Path) -> PathBuf {
        root.join("state.json")
    }

    fn load_state(root: &Path) -> CacheResult<StoreState> {
        let path = Self::state_file(root);
        if !path.exists() {
            return Ok(StoreState::default());
        }
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&content) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "state.json corrupt, starting empty");
                Ok(StoreState::default())
            }
        }
    }

    fn save_state(root: &Path, state: &StoreState) -> CacheResult<()> {
        let path = Self::state_file(root);
        let tmp = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(state)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#![forbid(unsafe_code)]

use std::{
    fmt,
    ops::Range,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use kinema_core::CacheKey;
use kinema_storage::{CacheFile, FragmentIndex, StorageError, WaitOutcome};
use tracing::debug;

use crate::{
    CacheError, CacheResult,
    record::IndexRecord,
    store::DiskCacheStore,
};

/// Live association between a cache key, its on-disk state, and the
/// in-memory [`FragmentIndex`].
///
/// Exactly one session is live per key; concurrent opens share it via
/// `Arc`. The index is mutated only by the fetch worker (through
/// [`write`](Self::write)) and read by the playback side; a mutex
/// serializes both. Dropping the last reference flushes the sidecar.
pub struct CacheSession {
    key: CacheKey,
    hex: String,
    dir: PathBuf,
    store: Arc<DiskCacheStore>,
    file: CacheFile,
    index: Mutex<FragmentIndex>,
}

impl fmt::Debug for CacheSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSession")
            .field("key", &self.key)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl CacheSession {
    pub(crate) fn new(
        key: CacheKey,
        dir: PathBuf,
        store: Arc<DiskCacheStore>,
        file: CacheFile,
        index: FragmentIndex,
    ) -> Arc<Self> {
        Arc::new(Self {
            hex: key.to_hex(),
            key,
            dir,
            store,
            file,
            index: Mutex::new(index),
        })
    }

    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Write bytes at `offset` and record coverage.
    ///
    /// Coverage is inserted into the index only after the disk write
    /// returned, so the index never claims bytes that are not durable.
    ///
    /// # Errors
    ///
    /// [`CacheError::Corrupt`] when the write would extend past the
    /// known total size (defensive invariant check), otherwise storage
    /// errors.
    pub async fn write(&self, offset: u64, data: &[u8]) -> CacheResult<()> {
        if data.is_empty() {
            return Ok(());
        }

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| CacheError::Corrupt("write offset overflow".to_string()))?;

        if let Some(total) = self.total_expected_size() {
            if end > total {
                return Err(CacheError::Corrupt(format!(
                    "write [{offset}, {end}) exceeds expected size {total}"
                )));
            }
        }

        self.file.write_at(offset, data).await?;

        let delta = {
            let mut index = self.index.lock().expect("index lock");
            let before = index.covered_len();
            index.insert(offset..end);
            index.covered_len() - before
        };
        self.store.add_bytes(&self.hex, delta);
        Ok(())
    }

    /// Read a fully covered range.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotCached`] when the range is not yet covered;
    /// callers check coverage first or treat this as "wait and retry".
    pub async fn read(&self, range: Range<u64>) -> CacheResult<Bytes> {
        if !self.is_fully_covered(range.clone()) {
            return Err(CacheError::NotCached {
                start: range.start,
                end: range.end,
            });
        }

        let len = usize::try_from(range.end - range.start).map_err(|_| {
            CacheError::Corrupt(format!("read range too large: {range:?}"))
        })?;

        match self.file.read_at(range.start, len).await {
            Ok(bytes) => Ok(bytes),
            Err(StorageError::NotCached { start, end }) => {
                Err(CacheError::NotCached { start, end })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until `range` is readable (playback path; never used by the
    /// fetch worker).
    ///
    /// # Errors
    ///
    /// Propagates storage failure/cancellation.
    pub async fn wait_range(&self, range: Range<u64>) -> CacheResult<WaitOutcome> {
        Ok(self.file.wait_range(range).await?)
    }

    /// Persist the sidecar index and the store accounting.
    ///
    /// # Errors
    ///
    /// Returns I/O or encode errors from the sidecar write.
    pub fn flush_index(&self) -> CacheResult<()> {
        let record = {
            let index = self.index.lock().expect("index lock");
            IndexRecord::from_index(&index)
        };
        record.save(&self.dir)?;
        self.store.persist_state()?;
        debug!(key = %self.key, "sidecar index flushed");
        Ok(())
    }

    /// Seal the backing file and stamp the key as completed.
    ///
    /// Called once the index covers `[0, total)`.
    ///
    /// # Errors
    ///
    /// Propagates seal/flush failures.
    pub async fn finish(&self) -> CacheResult<()> {
        let total = self.total_expected_size();
        self.file.seal(total).await?;
        self.flush_index()?;
        self.store.mark_completed(&self.hex)?;
        Ok(())
    }

    // Index accessors. Each takes the lock briefly; none is held across
    // an await point.

    #[must_use]
    pub fn is_fully_covered(&self, range: Range<u64>) -> bool {
        self.index.lock().expect("index lock").is_fully_covered(range)
    }

    #[must_use]
    pub fn covered_ranges(&self) -> Vec<Range<u64>> {
        self.index.lock().expect("index lock").covered_ranges()
    }

    #[must_use]
    pub fn first_gap_after(&self, offset: u64) -> Option<Range<u64>> {
        self.index.lock().expect("index lock").first_gap_after(offset)
    }

    #[must_use]
    pub fn gaps_within(&self, range: Range<u64>) -> Vec<Range<u64>> {
        self.index.lock().expect("index lock").gaps_within(range)
    }

    #[must_use]
    pub fn fraction_complete(&self) -> f64 {
        self.index.lock().expect("index lock").fraction_complete()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.index.lock().expect("index lock").is_complete()
    }

    #[must_use]
    pub fn total_expected_size(&self) -> Option<u64> {
        self.index.lock().expect("index lock").total_expected_size()
    }

    /// Record a total size learned after the session was opened
    /// (e.g. from the first ranged response).
    pub fn set_total_expected_size(&self, total: u64) {
        self.index
            .lock()
            .expect("index lock")
            .set_total_expected_size(total);
    }
}

impl Drop for CacheSession {
    fn drop(&mut self) {
        if let Err(e) = self.flush_index() {
            debug!(key = %self.key, error = %e, "final index flush failed");
        }
        self.store.remove_live(&self.hex);
    }
}

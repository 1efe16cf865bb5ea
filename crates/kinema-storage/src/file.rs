#![forbid(unsafe_code)]

use std::{
    fmt,
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use random_access_disk::RandomAccessDisk;
use random_access_storage::RandomAccess;
use rangemap::RangeSet;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{StorageError, StorageResult};

/// Options for opening a disk-backed cache file.
#[derive(Clone, Debug)]
pub struct CacheFileOptions {
    /// Path to the backing file.
    pub path: PathBuf,

    /// Cancellation token for this resource lifecycle. `wait_range`
    /// resolves with [`StorageError::Cancelled`] once it fires, so
    /// nothing hangs when the owning session is torn down.
    pub cancel: CancellationToken,

    /// Optional length hint; the file may be extended to this size up
    /// front. A hint, not a contract; `seal` fixes the final length.
    pub initial_len: Option<u64>,
}

impl CacheFileOptions {
    pub fn new(path: impl Into<PathBuf>, cancel: CancellationToken) -> Self {
        Self {
            path: path.into(),
            cancel,
            initial_len: None,
        }
    }

    #[must_use]
    pub fn with_initial_len(mut self, len: u64) -> Self {
        self.initial_len = Some(len);
        self
    }
}

/// Lifecycle snapshot of a [`CacheFile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileStatus {
    InProgress,
    Sealed { final_len: Option<u64> },
    Failed,
}

/// Result of waiting for a byte range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The requested range is readable.
    Ready,
    /// The file is sealed and the range starts at/after EOF.
    Eof,
}

/// A single cached resource on disk, written in ranges.
///
/// Clone is cheap; all clones refer to the same underlying file.
///
/// # Contract
/// - A range becomes readable only after its `write_at` returned, so the
///   published coverage never claims bytes that are not durably written.
/// - `read_at` never waits: uncovered ranges fail with
///   [`StorageError::NotCached`]. Blocking semantics live in `wait_range`.
/// - `seal` fixes EOF and rejects further writes; `fail` wakes all
///   waiters and makes subsequent operations fail consistently.
#[derive(Clone)]
pub struct CacheFile {
    inner: Arc<Inner>,
}

impl fmt::Debug for CacheFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFile")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl CacheFile {
    /// Open or create the backing file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`]/[`StorageError::Disk`] when the file
    /// cannot be created or sized.
    pub async fn open(opts: CacheFileOptions) -> StorageResult<Self> {
        if let Some(parent) = opts.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut disk = RandomAccessDisk::open(opts.path.clone()).await?;
        if let Some(len) = opts.initial_len {
            if disk.len().await? < len {
                disk.truncate(len).await?;
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                path: opts.path,
                cancel: opts.cancel,
                disk: Mutex::new(disk),
                state: Mutex::new(State::new()),
                notify: Notify::new(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub async fn status(&self) -> FileStatus {
        let state = self.inner.state.lock().await;
        if state.failed.is_some() {
            return FileStatus::Failed;
        }
        if state.sealed {
            return FileStatus::Sealed {
                final_len: state.final_len,
            };
        }
        FileStatus::InProgress
    }

    /// Publish coverage restored from a persisted index, without writing.
    ///
    /// Used when reopening a partially downloaded resource whose bytes
    /// are already on disk.
    pub async fn restore(&self, ranges: &[Range<u64>]) {
        {
            let mut state = self.inner.state.lock().await;
            for r in ranges {
                if !r.is_empty() {
                    state.available.insert(r.clone());
                }
            }
        }
        self.inner.notify.notify_waiters();
    }

    /// Write bytes at `offset`. Coverage is published only after the
    /// disk write returned.
    ///
    /// # Errors
    ///
    /// [`StorageError::Sealed`] after `seal`, [`StorageError::Failed`]
    /// after `fail`, [`StorageError::Cancelled`] once the token fired,
    /// otherwise disk errors.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if data.is_empty() {
            return Ok(());
        }

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(StorageError::InvalidRange {
                start: offset,
                end: offset,
            })?;

        {
            let state = self.inner.state.lock().await;
            if let Some(err) = &state.failed {
                return Err(StorageError::Failed(err.clone()));
            }
            if state.sealed {
                return Err(StorageError::Sealed);
            }
        }

        {
            let mut disk = self.inner.disk.lock().await;
            disk.write(offset, data).await?;
        }

        {
            let mut state = self.inner.state.lock().await;
            state.available.insert(offset..end);
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Read `len` bytes at `offset` without waiting.
    ///
    /// Clamps against EOF once sealed (reads at/after EOF yield empty
    /// bytes).
    ///
    /// # Errors
    ///
    /// [`StorageError::NotCached`] when any part of the (clamped) range
    /// is not covered; [`StorageError::Failed`] after `fail`.
    pub async fn read_at(&self, offset: u64, len: usize) -> StorageResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }

        let effective_len = {
            let state = self.inner.state.lock().await;
            if let Some(err) = &state.failed {
                return Err(StorageError::Failed(err.clone()));
            }

            match (state.sealed, state.final_len) {
                (true, Some(final_len)) if offset >= final_len => return Ok(Bytes::new()),
                (true, Some(final_len)) => len.min((final_len - offset) as usize),
                _ => len,
            }
        };

        let end = offset
            .checked_add(effective_len as u64)
            .ok_or(StorageError::InvalidRange {
                start: offset,
                end: offset,
            })?;

        {
            let state = self.inner.state.lock().await;
            if !state.is_covered(offset..end) {
                return Err(StorageError::NotCached { start: offset, end });
            }
        }

        let mut disk = self.inner.disk.lock().await;
        let data = disk.read(offset, effective_len as u64).await?;
        Ok(Bytes::from(data))
    }

    /// Wait until `range` becomes readable, or EOF/failure/cancellation.
    ///
    /// # Errors
    ///
    /// [`StorageError::Failed`] after `fail`, [`StorageError::Cancelled`]
    /// on token cancellation, [`StorageError::InvalidRange`] for empty
    /// ranges.
    pub async fn wait_range(&self, range: Range<u64>) -> StorageResult<WaitOutcome> {
        if range.start >= range.end {
            return Err(StorageError::InvalidRange {
                start: range.start,
                end: range.end,
            });
        }

        loop {
            {
                let state = self.inner.state.lock().await;

                if let Some(err) = &state.failed {
                    return Err(StorageError::Failed(err.clone()));
                }

                if let Some(final_len) = state.final_len {
                    if range.start >= final_len {
                        return Ok(WaitOutcome::Eof);
                    }
                    // Only the part before EOF has to be covered.
                    let needed_end = range.end.min(final_len);
                    if state.is_covered(range.start..needed_end) {
                        return Ok(WaitOutcome::Ready);
                    }
                } else if state.is_covered(range.clone()) {
                    return Ok(WaitOutcome::Ready);
                }
            }

            tokio::select! {
                () = self.inner.cancel.cancelled() => return Err(StorageError::Cancelled),
                () = self.inner.notify.notified() => {}
            }
        }
    }

    /// Whether `range` is fully covered right now.
    pub async fn is_covered(&self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        let state = self.inner.state.lock().await;
        state.is_covered(range)
    }

    /// Snapshot of the covered ranges.
    pub async fn covered(&self) -> Vec<Range<u64>> {
        let state = self.inner.state.lock().await;
        state.available.iter().cloned().collect()
    }

    /// Seal the file: fixes EOF (when known) and rejects further writes.
    pub async fn seal(&self, final_len: Option<u64>) -> StorageResult<()> {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(err) = &state.failed {
                return Err(StorageError::Failed(err.clone()));
            }
            state.sealed = true;
            state.final_len = final_len;
        }
        debug!(path = %self.inner.path.display(), ?final_len, "cache file sealed");
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Mark the file failed, waking all waiters.
    pub async fn fail(&self, error: impl Into<String>) {
        {
            let mut state = self.inner.state.lock().await;
            state.failed = Some(error.into());
        }
        self.inner.notify.notify_waiters();
    }
}

struct Inner {
    path: PathBuf,
    cancel: CancellationToken,
    disk: Mutex<RandomAccessDisk>,
    state: Mutex<State>,
    notify: Notify,
}

#[derive(Debug)]
struct State {
    available: RangeSet<u64>,
    sealed: bool,
    final_len: Option<u64>,
    failed: Option<String>,
}

impl State {
    fn new() -> Self {
        Self {
            available: RangeSet::new(),
            sealed: false,
            final_len: None,
            failed: None,
        }
    }

    fn is_covered(&self, range: Range<u64>) -> bool {
        let mut cursor = range.start;
        for r in self.available.overlapping(&range) {
            if r.start > cursor {
                return false;
            }
            if r.end > cursor {
                cursor = r.end;
                if cursor >= range.end {
                    return true;
                }
            }
        }
        cursor >= range.end
    }
}

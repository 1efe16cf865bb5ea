#![forbid(unsafe_code)]

use std::{
    collections::VecDeque,
    fmt,
    ops::Range,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use futures::StreamExt;
use kinema_cache::CacheSession;
use kinema_net::{HttpClient, Net, RangeSpec};
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;

use crate::{
    FetchError,
    events::FetchEvent,
    options::FetchOptions,
    task::{DownloadTask, FetchPriority, TaskHandle, TaskState},
};

/// Handle to a session's fetch worker.
///
/// Clone is cheap; all clones drive the same worker. The worker runs
/// until [`stop`](Self::stop) (pending tasks cancelled, the active one
/// runs to completion) or until the session's cancellation token fires
/// (everything aborts).
#[derive(Clone)]
pub struct RangeFetcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for RangeFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeFetcher")
            .field("key", self.shared.session.key())
            .finish_non_exhaustive()
    }
}

struct Shared {
    session: Arc<CacheSession>,
    options: FetchOptions,
    queue: Mutex<Queue>,
    wake: Notify,
    cursor: AtomicU64,
    paused: AtomicBool,
    stopping: AtomicBool,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl Shared {
    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<DownloadTask>,
    active: Option<ActiveEntry>,
}

struct ActiveEntry {
    range: Range<u64>,
    /// Requests satisfied by this download instead of their own fetch.
    followers: Vec<watch::Sender<TaskState>>,
}

impl RangeFetcher {
    /// Spawn the worker for `session`, downloading from `url`.
    pub fn spawn(
        session: Arc<CacheSession>,
        net: HttpClient,
        url: Url,
        options: FetchOptions,
        events: mpsc::UnboundedSender<FetchEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let start_paused = options.start_paused;
        let shared = Arc::new(Shared {
            session,
            options,
            queue: Mutex::new(Queue::default()),
            wake: Notify::new(),
            cursor: AtomicU64::new(0),
            paused: AtomicBool::new(start_paused),
            stopping: AtomicBool::new(false),
            cancel,
            next_id: AtomicU64::new(0),
        });

        let worker = Arc::clone(&shared);
        tokio::spawn(async move {
            run(worker, net, url, events).await;
        });

        Self { shared }
    }

    /// Enqueue a fetch for `range`.
    ///
    /// Already-covered ranges resolve `Completed` immediately with no
    /// network I/O. Ranges whose uncovered bytes all fall inside the
    /// active download subscribe to it (dedup) rather than refetching.
    pub fn request_range(&self, range: Range<u64>, priority: FetchPriority) -> TaskHandle {
        let (tx, rx) = watch::channel(TaskState::Pending);
        let handle = TaskHandle::new(range.clone(), rx);

        if range.is_empty() || self.shared.session.is_fully_covered(range.clone()) {
            let _ = tx.send(TaskState::Completed);
            return handle;
        }

        if self.shared.stopping() || self.shared.cancel.is_cancelled() {
            let _ = tx.send(TaskState::Cancelled);
            return handle;
        }

        let gaps = self.shared.session.gaps_within(range.clone());
        let subsumed_by = |r: &Range<u64>| gaps.iter().all(|g| g.start >= r.start && g.end <= r.end);

        let mut queue = self.shared.queue.lock().expect("fetch queue lock");
        if let Some(active) = &mut queue.active {
            if subsumed_by(&active.range) {
                trace!(?range, active = ?active.range, "request satisfied by active task");
                active.followers.push(tx);
                return handle;
            }
        }
        for pending in &mut queue.pending {
            if subsumed_by(&pending.range) {
                trace!(?range, pending = ?pending.range, "request satisfied by queued task");
                pending.followers.push(tx);
                return handle;
            }
        }

        let task = DownloadTask {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            range,
            tx,
            followers: Vec::new(),
        };
        debug!(id = task.id, range = ?task.range, ?priority, "range request queued");
        match priority {
            FetchPriority::Urgent => queue.pending.push_front(task),
            FetchPriority::Normal => queue.pending.push_back(task),
        }
        drop(queue);

        self.shared.wake.notify_one();
        handle
    }

    /// Reprioritize toward a new playback position.
    ///
    /// Pending tasks are reordered nearest-gap-first relative to the
    /// cursor. A forward jump beyond the lookahead window supersedes
    /// pending tasks that lie entirely behind it (they are `Cancelled`;
    /// bytes already written stay valid). The active download is never
    /// aborted mid-flight.
    pub fn set_cursor(&self, offset: u64) {
        let prev = self.shared.cursor.swap(offset, Ordering::AcqRel);

        let mut queue = self.shared.queue.lock().expect("fetch queue lock");
        if offset > prev.saturating_add(self.shared.options.lookahead) {
            queue.pending.retain(|task| {
                if task.range.end <= offset {
                    debug!(id = task.id, range = ?task.range, "superseded by seek");
                    for follower in &task.followers {
                        let _ = follower.send(TaskState::Cancelled);
                    }
                    task.set_state(TaskState::Cancelled);
                    false
                } else {
                    true
                }
            });
        }
        queue
            .pending
            .make_contiguous()
            .sort_by_key(|task| distance_to_cursor(&task.range, offset));
        drop(queue);

        self.shared.wake.notify_one();
    }

    /// Suspend scheduling of new tasks. The in-flight task continues.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused()
    }

    /// Cancel all pending tasks immediately; the active task runs to
    /// natural completion, then the worker exits.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        let mut queue = self.shared.queue.lock().expect("fetch queue lock");
        for task in queue.pending.drain(..) {
            for follower in &task.followers {
                let _ = follower.send(TaskState::Cancelled);
            }
            task.set_state(TaskState::Cancelled);
        }
        drop(queue);
        self.shared.wake.notify_one();
    }
}

fn distance_to_cursor(range: &Range<u64>, cursor: u64) -> u64 {
    if cursor >= range.start && cursor < range.end {
        0
    } else if range.start >= cursor {
        range.start - cursor
    } else {
        // Entirely behind the cursor: after everything ahead of it.
        (u64::MAX / 2).saturating_add(cursor - range.end)
    }
}

async fn run(
    shared: Arc<Shared>,
    net: HttpClient,
    url: Url,
    events: mpsc::UnboundedSender<FetchEvent>,
) {
    debug!(key = %shared.session.key(), "fetch worker started");
    let mut announced_complete = false;
    let mut announced_idle = false;

    loop {
        if shared.cancel.is_cancelled() {
            cancel_all(&shared);
            debug!(key = %shared.session.key(), "fetch worker cancelled");
            return;
        }

        if shared.paused() && !shared.stopping() {
            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => continue,
                () = shared.wake.notified() => continue,
            }
        }

        let Some(task) = next_task(&shared) else {
            if shared.stopping() {
                debug!(key = %shared.session.key(), "fetch worker stopped");
                return;
            }

            if shared.session.is_complete() {
                if !announced_complete {
                    announced_complete = true;
                    if let Err(e) = shared.session.finish().await {
                        warn!(error = %e, "failed to seal completed session");
                    }
                    if let Some(total) = shared.session.total_expected_size() {
                        let _ = events.send(FetchEvent::DownloadComplete { total });
                    }
                }
            } else if !announced_idle {
                announced_idle = true;
                let _ = events.send(FetchEvent::Idle);
            }

            tokio::select! {
                biased;
                () = shared.cancel.cancelled() => {}
                () = shared.wake.notified() => {}
            }
            continue;
        };

        announced_idle = false;
        execute_task(&shared, &net, &url, &events, &task).await;
    }
}

/// Pop the highest-priority pending task, or plan a background gap-fill
/// toward the cursor when the queue is empty.
fn next_task(shared: &Shared) -> Option<DownloadTask> {
    let mut queue = shared.queue.lock().expect("fetch queue lock");

    if let Some(mut task) = queue.pending.pop_front() {
        queue.active = Some(ActiveEntry {
            range: task.range.clone(),
            followers: std::mem::take(&mut task.followers),
        });
        task.set_state(TaskState::Active);
        return Some(task);
    }

    if shared.stopping() || shared.paused() {
        return None;
    }

    // Background planning needs a known total; without one there is no
    // gap list, and fetching is purely request-driven.
    let cursor = shared.cursor.load(Ordering::Acquire);
    let gap = shared
        .session
        .first_gap_after(cursor)
        .or_else(|| shared.session.first_gap_after(0))?;
    let end = gap.end.min(gap.start.saturating_add(shared.options.chunk_size));
    let range = gap.start..end;

    let (tx, _rx) = watch::channel(TaskState::Active);
    let task = DownloadTask {
        id: shared.next_id.fetch_add(1, Ordering::Relaxed),
        range: range.clone(),
        tx,
        followers: Vec::new(),
    };
    trace!(id = task.id, ?range, cursor, "planned background gap fill");
    queue.active = Some(ActiveEntry {
        range,
        followers: Vec::new(),
    });
    Some(task)
}

async fn execute_task(
    shared: &Arc<Shared>,
    net: &HttpClient,
    url: &Url,
    events: &mpsc::UnboundedSender<FetchEvent>,
    task: &DownloadTask,
) {
    let _ = events.send(FetchEvent::TaskStarted {
        range: task.range.clone(),
    });

    // Resume property: only uncovered sub-ranges are fetched.
    let gaps = shared.session.gaps_within(task.range.clone());

    for gap in gaps {
        match fetch_gap(shared, net, url, events, gap).await {
            Ok(()) => {}
            Err(GapFailure::Cancelled) => {
                flush_best_effort(shared);
                finish_task(shared, task, TaskState::Cancelled);
                return;
            }
            Err(GapFailure::Failed { error, terminal }) => {
                flush_best_effort(shared);
                warn!(id = task.id, range = ?task.range, %error, terminal, "task failed");
                let _ = events.send(FetchEvent::TaskFailed {
                    range: task.range.clone(),
                    error: error.clone(),
                    terminal,
                });
                finish_task(shared, task, TaskState::Failed { error, terminal });
                if terminal {
                    // A fatal failure surfaces once; no further work is
                    // scheduled for this session.
                    shared.stopping.store(true, Ordering::Release);
                    cancel_all(shared);
                    shared.wake.notify_one();
                }
                return;
            }
        }
    }

    flush_best_effort(shared);
    debug!(id = task.id, range = ?task.range, "task completed");
    let _ = events.send(FetchEvent::TaskCompleted {
        range: task.range.clone(),
    });
    finish_task(shared, task, TaskState::Completed);
}

enum GapFailure {
    Cancelled,
    Failed { error: String, terminal: bool },
}

/// Download one uncovered gap, writing through the session per chunk so
/// partial progress survives a crash. Transient failures resume from the
/// last durable offset with bounded backoff.
async fn fetch_gap(
    shared: &Arc<Shared>,
    net: &HttpClient,
    url: &Url,
    events: &mpsc::UnboundedSender<FetchEvent>,
    gap: Range<u64>,
) -> Result<(), GapFailure> {
    let total = shared.session.total_expected_size();
    let max_retries = shared.options.retry.max_retries;
    let mut offset = gap.start;
    let mut attempt: u32 = 0;

    'request: while offset < gap.end {
        if shared.cancel.is_cancelled() {
            return Err(GapFailure::Cancelled);
        }

        let spec = RangeSpec::from_range(offset..gap.end);
        let mut stream = match net.get_range(url.clone(), spec, None).await {
            Ok(stream) => stream,
            Err(e) => {
                if e.is_retryable() && attempt < max_retries {
                    attempt += 1;
                    backoff(shared, attempt).await?;
                    continue 'request;
                }
                return Err(GapFailure::Failed {
                    error: e.to_string(),
                    terminal: true,
                });
            }
        };

        loop {
            let chunk = tokio::select! {
                biased;
                () = shared.cancel.cancelled() => return Err(GapFailure::Cancelled),
                chunk = stream.next() => chunk,
            };

            match chunk {
                None => {
                    if offset < gap.end {
                        // Body ended early; treat like a dropped connection.
                        let short = FetchError::ShortBody {
                            start: gap.start,
                            end: gap.end,
                            got: offset - gap.start,
                        };
                        if attempt < max_retries {
                            attempt += 1;
                            debug!(%short, attempt, "short body, resuming");
                            backoff(shared, attempt).await?;
                            continue 'request;
                        }
                        return Err(GapFailure::Failed {
                            error: short.to_string(),
                            terminal: true,
                        });
                    }
                    break;
                }
                Some(Err(e)) => {
                    if e.is_retryable() && attempt < max_retries {
                        attempt += 1;
                        debug!(error = %e, attempt, resume_at = offset, "stream error, resuming");
                        backoff(shared, attempt).await?;
                        continue 'request;
                    }
                    return Err(GapFailure::Failed {
                        error: e.to_string(),
                        terminal: true,
                    });
                }
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    // Never write past the gap; over-long bodies are clamped.
                    let take = ((gap.end - offset).min(bytes.len() as u64)) as usize;
                    if let Err(e) = shared.session.write(offset, &bytes[..take]).await {
                        return Err(GapFailure::Failed {
                            error: e.to_string(),
                            terminal: true,
                        });
                    }
                    offset += take as u64;
                    attempt = 0;
                    let _ = events.send(FetchEvent::Progress { offset, total });
                    if offset >= gap.end {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn backoff(shared: &Shared, attempt: u32) -> Result<(), GapFailure> {
    let delay = shared.options.retry.delay_for_attempt(attempt);
    tokio::select! {
        biased;
        () = shared.cancel.cancelled() => Err(GapFailure::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

fn finish_task(shared: &Shared, task: &DownloadTask, state: TaskState) {
    let mut queue = shared.queue.lock().expect("fetch queue lock");
    if let Some(active) = queue.active.take() {
        for follower in active.followers {
            let _ = follower.send(state.clone());
        }
    }
    drop(queue);
    task.set_state(state);
}

fn flush_best_effort(shared: &Shared) {
    if let Err(e) = shared.session.flush_index() {
        warn!(error = %e, "index flush failed");
    }
}

fn cancel_all(shared: &Shared) {
    let mut queue = shared.queue.lock().expect("fetch queue lock");
    for task in queue.pending.drain(..) {
        for follower in &task.followers {
            let _ = follower.send(TaskState::Cancelled);
        }
        task.set_state(TaskState::Cancelled);
    }
    if let Some(active) = queue.active.take() {
        for follower in active.followers {
            let _ = follower.send(TaskState::Cancelled);
        }
    }
}

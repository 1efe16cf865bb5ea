#![forbid(unsafe_code)]

use std::ops::Range;

/// Observability events emitted by a [`RangeFetcher`](crate::RangeFetcher).
///
/// Delivered through the session's event channel so subscribers see one
/// total order per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// A download task went active.
    TaskStarted { range: Range<u64> },

    /// Bytes durably written up to `offset` within the active task.
    Progress { offset: u64, total: Option<u64> },

    /// The active task finished; its whole range is now covered.
    TaskCompleted { range: Range<u64> },

    /// The active task failed. `terminal` failures have exhausted their
    /// retries (or were never retryable) and surface to subscribers.
    TaskFailed {
        range: Range<u64>,
        error: String,
        terminal: bool,
    },

    /// Every byte of the resource is on disk and the session is sealed.
    DownloadComplete { total: u64 },

    /// Queue drained with nothing left to plan.
    Idle,
}

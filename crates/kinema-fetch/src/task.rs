#![forbid(unsafe_code)]

use std::ops::Range;

use tokio::sync::watch;

/// Queue position for a requested range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchPriority {
    /// Appended behind existing pending tasks.
    Normal,
    /// Jumps the queue; used for cursor-driven gaps.
    Urgent,
}

/// Download task state machine: `Pending -> Active -> terminal`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Active,
    Completed,
    Failed { error: String, terminal: bool },
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed { .. } | TaskState::Cancelled
        )
    }
}

/// Caller-side view of one requested range.
///
/// Ranges already covered resolve `Completed` without any network I/O;
/// ranges overlapping the active download resolve when it does.
#[derive(Debug)]
pub struct TaskHandle {
    range: Range<u64>,
    rx: watch::Receiver<TaskState>,
}

impl TaskHandle {
    pub(crate) fn new(range: Range<u64>, rx: watch::Receiver<TaskState>) -> Self {
        Self { range, rx }
    }

    #[must_use]
    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    /// Current state snapshot.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.rx.borrow().clone()
    }

    /// Wait for a terminal state.
    ///
    /// Resolves `Cancelled` if the fetcher went away before finishing
    /// the task.
    pub async fn wait(&mut self) -> TaskState {
        let result = self
            .rx
            .wait_for(TaskState::is_terminal)
            .await
            .map(|state| state.clone());
        match result {
            Ok(state) => state,
            Err(_) => {
                let last = self.rx.borrow().clone();
                if last.is_terminal() {
                    last
                } else {
                    TaskState::Cancelled
                }
            }
        }
    }
}

/// Worker-side task record.
#[derive(Debug)]
pub(crate) struct DownloadTask {
    pub id: u64,
    pub range: Range<u64>,
    pub tx: watch::Sender<TaskState>,
    /// Later requests whose uncovered bytes this task subsumes; resolved
    /// with the same terminal state.
    pub followers: Vec<watch::Sender<TaskState>>,
}

impl DownloadTask {
    pub(crate) fn set_state(&self, state: TaskState) {
        let _ = self.tx.send(state);
    }
}

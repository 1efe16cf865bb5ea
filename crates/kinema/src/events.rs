#![forbid(unsafe_code)]

use std::ops::Range;

use tokio::sync::{broadcast, mpsc};

use crate::status::PlayerStatus;

/// Where the bytes currently being delivered come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheType {
    /// Nothing cached and nothing fetching.
    None,
    /// Served out of an already-live session's warm state.
    Memory,
    /// Fully present in the disk cache.
    Disk,
    /// Being filled by a live network fetch.
    WebFetching,
}

/// Events delivered to session subscribers.
///
/// All events for a session flow through one ordered delivery channel:
/// subscribers observe a total order, and each logical change is
/// delivered at most once.
#[derive(Clone, Debug, PartialEq)]
pub enum PlayerEvent {
    StatusChanged { status: PlayerStatus },

    /// The resource length became known.
    FileLength { bytes: u64 },

    DownloadProgress {
        cache_type: CacheType,
        covered_ranges: Vec<Range<u64>>,
        expected_size: Option<u64>,
        error: Option<String>,
    },

    PlayProgress {
        elapsed_seconds: f64,
        total_seconds: f64,
        error: Option<String>,
    },
}

/// Serialized per-session event delivery.
///
/// Producers publish into an mpsc queue; a single dispatcher task drains
/// it, drops consecutive duplicates, and fans out over a broadcast
/// channel. One queue, one drainer: total order per session.
#[derive(Debug)]
pub(crate) struct EventDispatcher {
    tx: mpsc::UnboundedSender<PlayerEvent>,
    broadcast_tx: broadcast::Sender<PlayerEvent>,
}

impl EventDispatcher {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::unbounded_channel::<PlayerEvent>();
        let (broadcast_tx, _) = broadcast::channel(capacity);

        let fan_out = broadcast_tx.clone();
        tokio::spawn(async move {
            let mut last: Option<PlayerEvent> = None;
            // Events published before the first subscriber attaches are
            // held back and flushed, in order, once one exists.
            let mut backlog: std::collections::VecDeque<PlayerEvent> =
                std::collections::VecDeque::new();

            while let Some(event) = rx.recv().await {
                if last.as_ref() == Some(&event) {
                    continue;
                }
                last = Some(event.clone());

                if fan_out.receiver_count() == 0 {
                    if backlog.len() == capacity {
                        backlog.pop_front();
                    }
                    backlog.push_back(event);
                    continue;
                }
                while let Some(held) = backlog.pop_front() {
                    let _ = fan_out.send(held);
                }
                let _ = fan_out.send(event);
            }
        });

        Self { tx, broadcast_tx }
    }

    pub(crate) fn publish(&self, event: PlayerEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.broadcast_tx.subscribe()
    }
}

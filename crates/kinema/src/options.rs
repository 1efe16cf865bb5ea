#![forbid(unsafe_code)]

use std::sync::Arc;

use kinema_cache::StoreOptions;
use kinema_core::{DefaultKeyRule, KeyRule};
use kinema_fetch::FetchOptions;
use kinema_net::NetOptions;

use crate::hooks::PolicyHooks;

/// Per-play options.
#[derive(Clone, Debug)]
pub struct PlayOptions {
    /// Reuse cached data for the key when present. When `false`, the
    /// key's cache is reset before playback starts.
    pub use_cache_if_present: bool,
    /// Replay from the start when playback finishes (subject to the
    /// auto-replay policy hook).
    pub auto_replay: bool,
    /// Consult the download policy hook even when the key is partially
    /// cached, not only on a complete miss.
    pub require_download_confirmation: bool,
    /// Bytes ahead of the cursor that must be covered for `Ready`.
    pub lookahead: u64,
}

impl Default for PlayOptions {
    fn default() -> Self {
        Self {
            use_cache_if_present: true,
            auto_replay: false,
            require_download_confirmation: false,
            lookahead: 2 * 1024 * 1024,
        }
    }
}

impl PlayOptions {
    #[must_use]
    pub fn with_use_cache_if_present(mut self, value: bool) -> Self {
        self.use_cache_if_present = value;
        self
    }

    #[must_use]
    pub fn with_auto_replay(mut self, value: bool) -> Self {
        self.auto_replay = value;
        self
    }

    #[must_use]
    pub fn with_require_download_confirmation(mut self, value: bool) -> Self {
        self.require_download_confirmation = value;
        self
    }

    #[must_use]
    pub fn with_lookahead(mut self, lookahead: u64) -> Self {
        self.lookahead = lookahead;
        self
    }
}

/// Coordinator construction options.
///
/// The coordinator is the process-wide registry: build it once and pass
/// it around by reference; there is no hidden global instance.
#[derive(Clone)]
pub struct CoordinatorOptions {
    pub store: StoreOptions,
    pub net: NetOptions,
    pub fetch: FetchOptions,
    pub hooks: PolicyHooks,
    /// URL canonicalization rule for cache-key derivation.
    pub key_rule: Arc<dyn KeyRule>,
    /// Capacity of each session's event broadcast channel.
    pub events_capacity: usize,
}

impl std::fmt::Debug for CoordinatorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorOptions")
            .field("store", &self.store)
            .field("net", &self.net)
            .field("fetch", &self.fetch)
            .field("hooks", &self.hooks)
            .field("events_capacity", &self.events_capacity)
            .finish_non_exhaustive()
    }
}

impl CoordinatorOptions {
    pub fn new(store: StoreOptions) -> Self {
        Self {
            store,
            net: NetOptions::default(),
            fetch: FetchOptions::default(),
            hooks: PolicyHooks::default(),
            key_rule: Arc::new(DefaultKeyRule),
            events_capacity: 64,
        }
    }

    #[must_use]
    pub fn with_net(mut self, net: NetOptions) -> Self {
        self.net = net;
        self
    }

    #[must_use]
    pub fn with_fetch(mut self, fetch: FetchOptions) -> Self {
        self.fetch = fetch;
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: PolicyHooks) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_key_rule(mut self, rule: impl KeyRule) -> Self {
        self.key_rule = Arc::new(rule);
        self
    }

    #[must_use]
    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }
}

#![forbid(unsafe_code)]

//! Progressive video download coordination for kinema.
//!
//! [`PlaybackCoordinator`] is the single entry point: `play(url, options)`
//! resolves the cache key, opens or joins the disk cache session, spawns
//! the range fetcher, and hands back a [`SessionHandle`] through which an
//! external renderer reads bytes, advances the playback cursor, and
//! subscribes to status/progress events.
//!
//! # Example
//!
//! ```ignore
//! use kinema::{CoordinatorOptions, PlayOptions, PlaybackCoordinator};
//! use kinema_cache::StoreOptions;
//!
//! let coordinator = PlaybackCoordinator::new(CoordinatorOptions::new(
//!     StoreOptions::new("/var/cache/kinema"),
//! ))?;
//! let session = coordinator.play(url, PlayOptions::default()).await?;
//! let mut events = session.subscribe();
//! session.advance_to(0);
//! ```

mod coordinator;
mod cursor;
mod error;
mod events;
mod hooks;
mod options;
mod session;
mod status;

pub use coordinator::PlaybackCoordinator;
pub use cursor::{PlaybackCursor, Readiness};
pub use error::{PlayerError, PlayerResult};
pub use events::{CacheType, PlayerEvent};
pub use hooks::PolicyHooks;
pub use kinema_core::{CacheKey, DefaultKeyRule, KeepQueryKeyRule, KeyRule};
pub use options::{CoordinatorOptions, PlayOptions};
pub use session::SessionHandle;
pub use status::PlayerStatus;

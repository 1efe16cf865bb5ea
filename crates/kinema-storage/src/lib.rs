#![forbid(unsafe_code)]

//! Storage primitives for kinema.
//!
//! Two building blocks, no policy:
//! - [`FragmentIndex`]: which byte ranges of a resource are present,
//!   with merge/gap/fraction queries. Pure data structure, no I/O.
//! - [`CacheFile`]: a disk-backed random-access resource that publishes
//!   a written range only after the bytes are durably on disk, and whose
//!   reads fail fast with [`StorageError::NotCached`] instead of waiting
//!   for network data.

mod error;
mod file;
mod index;

pub use error::{StorageError, StorageResult};
pub use file::{CacheFile, CacheFileOptions, FileStatus, WaitOutcome};
pub use index::FragmentIndex;

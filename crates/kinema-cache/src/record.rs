#![forbid(unsafe_code)]

//! Sidecar index record: the on-disk form of a [`FragmentIndex`].

use std::path::Path;

use kinema_storage::FragmentIndex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{CacheError, CacheResult};

pub(crate) const DATA_FILE: &str = "data.bin";
pub(crate) const INDEX_FILE: &str = "index.bin";

const RECORD_VERSION: u32 = 1;

/// Serialized fragment index: ordered `(start, len)` pairs plus the
/// recorded total expected size.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct IndexRecord {
    version: u32,
    total_expected_size: Option<u64>,
    ranges: Vec<(u64, u64)>,
}

impl IndexRecord {
    pub(crate) fn from_index(index: &FragmentIndex) -> Self {
        Self {
            version: RECORD_VERSION,
            total_expected_size: index.total_expected_size(),
            ranges: index
                .covered_ranges()
                .into_iter()
                .map(|r| (r.start, r.end - r.start))
                .collect(),
        }
    }

    pub(crate) fn into_index(self) -> FragmentIndex {
        let mut index = self
            .total_expected_size
            .map_or_else(FragmentIndex::new, FragmentIndex::with_total_size);
        for (start, len) in self.ranges {
            index.insert(start..start.saturating_add(len));
        }
        index
    }

    pub(crate) fn total_expected_size(&self) -> Option<u64> {
        self.total_expected_size
    }

    /// Highest covered offset; used to validate against the data blob.
    pub(crate) fn covered_end(&self) -> u64 {
        self.ranges
            .iter()
            .map(|(start, len)| start.saturating_add(*len))
            .max()
            .unwrap_or(0)
    }

    /// Load the sidecar for a key directory.
    ///
    /// Missing or undecodable sidecars yield `None`; the caller starts
    /// with an empty index (conservative cold start).
    pub(crate) fn load(dir: &Path) -> Option<Self> {
        let path = dir.join(INDEX_FILE);
        let buf = match std::fs::read(&path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "sidecar unreadable, starting cold");
                return None;
            }
        };

        match bincode::serde::decode_from_slice::<IndexRecord, _>(&buf, bincode::config::legacy()) {
            Ok((record, _)) if record.version == RECORD_VERSION => Some(record),
            Ok(record) => {
                warn!(
                    path = %path.display(),
                    version = record.0.version,
                    "sidecar version unsupported, starting cold"
                );
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "sidecar corrupt, starting cold");
                None
            }
        }
    }

    /// Persist atomically: write to `.tmp`, then rename over the sidecar.
    pub(crate) fn save(&self, dir: &Path) -> CacheResult<()> {
        std::fs::create_dir_all(dir)?;
        let bytes = bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| CacheError::Corrupt(format!("sidecar encode: {e}")))?;

        let tmp = dir.join(format!("{INDEX_FILE}.tmp"));
        let path = dir.join(INDEX_FILE);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

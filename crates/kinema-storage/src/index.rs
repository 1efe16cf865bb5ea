#![forbid(unsafe_code)]

//! In-memory index of which byte ranges of a resource are cached.

use std::ops::Range;

use rangemap::RangeSet;

/// Tracks the cached byte ranges of one resource.
///
/// Ranges are half-open `[start, end)`. `RangeSet` merges adjacent and
/// overlapping ranges on insert, so the covered set is always a strictly
/// increasing sequence of non-overlapping ranges, independent of the
/// order inserts arrived in.
#[derive(Clone, Debug, Default)]
pub struct FragmentIndex {
    ranges: RangeSet<u64>,
    total_expected_size: Option<u64>,
}

impl FragmentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ranges: RangeSet::new(),
            total_expected_size: None,
        }
    }

    #[must_use]
    pub fn with_total_size(total: u64) -> Self {
        Self {
            ranges: RangeSet::new(),
            total_expected_size: Some(total),
        }
    }

    /// Record a newly cached range. Idempotent; empty ranges are ignored.
    pub fn insert(&mut self, range: Range<u64>) {
        if !range.is_empty() {
            self.ranges.insert(range);
        }
    }

    /// Current covered ranges, ascending by start, non-overlapping.
    #[must_use]
    pub fn covered_ranges(&self) -> Vec<Range<u64>> {
        self.ranges.iter().cloned().collect()
    }

    /// Sum of covered lengths.
    #[must_use]
    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    /// Whether `range` is a subset of the union of covered ranges.
    ///
    /// Empty ranges are trivially covered.
    #[must_use]
    pub fn is_fully_covered(&self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }

        // Walk overlapping covered ranges; any hole before the cursor
        // reaches range.end means not covered.
        let mut cursor = range.start;
        for r in self.ranges.overlapping(&range) {
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

    /// First uncovered sub-range at or after `offset`.
    ///
    /// Bounded on the right by the total expected size; `None` when the
    /// total is unknown or everything from `offset` onward is covered.
    #[must_use]
    pub fn first_gap_after(&self, offset: u64) -> Option<Range<u64>> {
        let total = self.total_expected_size?;
        if offset >= total {
            return None;
        }
        self.ranges.gaps(&(offset..total)).next()
    }

    /// Uncovered sub-ranges within `range`, ascending.
    ///
    /// Unlike [`first_gap_after`](Self::first_gap_after) this does not
    /// need a known total size; the bound is the range itself.
    #[must_use]
    pub fn gaps_within(&self, range: Range<u64>) -> Vec<Range<u64>> {
        if range.is_empty() {
            return Vec::new();
        }
        self.ranges.gaps(&range).collect()
    }

    /// Covered bytes / total expected size; `0.0` while the total is unknown.
    #[must_use]
    pub fn fraction_complete(&self) -> f64 {
        match self.total_expected_size {
            Some(0) => 1.0,
            Some(total) => self.covered_len() as f64 / total as f64,
            None => 0.0,
        }
    }

    /// Whether `[0, total)` is fully covered. `false` while total is unknown.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self.total_expected_size {
            Some(0) => true,
            Some(total) => self.is_fully_covered(0..total),
            None => false,
        }
    }

    #[must_use]
    pub fn total_expected_size(&self) -> Option<u64> {
        self.total_expected_size
    }

    /// Total size may become known later (e.g. from Content-Length).
    pub fn set_total_expected_size(&mut self, total: u64) {
        self.total_expected_size = Some(total);
    }
}

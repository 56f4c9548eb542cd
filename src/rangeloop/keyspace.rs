//! Keyspace range math
//!
//! Segments are partitioned by stream id, a 128-bit UUID compared as a
//! big-endian integer. [`compute_ranges`] cuts that space into `n` contiguous,
//! equal-width half-open ranges; the first range has no start and the last
//! has no end so together they cover every possible key exactly once.

use std::fmt;
use uuid::Uuid;

use crate::rangeloop::error::{LoopError, LoopResult};

/// Half-open interval `[start, end)` over stream ids.
///
/// A missing `start` means "from the beginning of the keyspace", a missing
/// `end` means "to the end". The default value is the unbounded range.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct KeyspaceRange {
    pub start: Option<Uuid>,
    pub end: Option<Uuid>,
}

impl KeyspaceRange {
    /// Create a range, rejecting empty or inverted bounds
    pub fn new(start: Option<Uuid>, end: Option<Uuid>) -> LoopResult<Self> {
        if let (Some(start), Some(end)) = (start, end) {
            if start >= end {
                return Err(LoopError::configuration(format!(
                    "range start {} must be below end {}",
                    start, end
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// The range covering the whole keyspace
    pub fn full() -> Self {
        Self::default()
    }

    /// Whether neither side is bounded
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Whether `key` falls inside the range
    pub fn contains(&self, key: &Uuid) -> bool {
        let after_start = self.start.map_or(true, |start| *key >= start);
        let before_end = self.end.map_or(true, |end| *key < end);
        after_start && before_end
    }
}

impl fmt::Display for KeyspaceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(f, "[{}", start)?,
            None => write!(f, "[-inf")?,
        }
        match self.end {
            Some(end) => write!(f, ", {})", end),
            None => write!(f, ", +inf)"),
        }
    }
}

/// Compute the `n - 1` boundaries that split the keyspace into `n` equal parts.
///
/// The i-th boundary is `i * floor(2^128 / n)`. `n == 0` is treated as `1`,
/// which yields no boundaries at all.
pub fn compute_boundaries(n: u32) -> Vec<Uuid> {
    let n = u128::from(n.max(1));
    if n == 1 {
        return Vec::new();
    }

    // floor(2^128 / n) without overflowing: 2^128 = u128::MAX + 1
    let mut step = u128::MAX / n;
    if u128::MAX % n == n - 1 {
        step += 1;
    }

    (1..n).map(|i| Uuid::from_u128(i * step)).collect()
}

/// Split the keyspace into `n` contiguous ranges ordered by start.
pub fn compute_ranges(n: u32) -> Vec<KeyspaceRange> {
    let boundaries = compute_boundaries(n);

    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut start = None;
    for boundary in boundaries {
        ranges.push(KeyspaceRange {
            start,
            end: Some(boundary),
        });
        start = Some(boundary);
    }
    ranges.push(KeyspaceRange { start, end: None });

    ranges
}

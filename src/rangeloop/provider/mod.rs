//! Segment sources
//!
//! A [`RangeSplitter`] turns a backend into one [`SegmentProvider`] per
//! partition. Providers are owned by a single pass and dropped at its end.
//!
//! Two backends ship with the crate:
//!
//! - **rocks**: indexed range scans over a RocksDB column family
//! - **avro**: a point-in-time export in Avro object container files

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::keyspace::KeyspaceRange;
use crate::rangeloop::observer::ObserverResult;
use crate::rangeloop::segment::{Segment, SegmentPosition};

pub mod avro;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use avro::{AvroFileSource, AvroSegmentsSplitter, AvroSource, InMemoryAvroSource};
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksRangeSplitter, RocksSegmentStore};

/// Forward-only iteration over the segments of one partition
#[async_trait]
pub trait SegmentProvider: Send {
    /// The keyspace slice this provider covers, for diagnostics
    fn range(&self) -> KeyspaceRange;

    /// Fetch the next batch. `None` means the partition is exhausted; a batch
    /// is never empty and never larger than the configured batch size.
    async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> LoopResult<Option<Vec<Segment>>>;

    /// Call `callback` with every remaining batch until the partition is
    /// exhausted, the callback fails or the token is cancelled
    async fn iterate(
        &mut self,
        cancel: &CancellationToken,
        callback: &mut (dyn for<'s> FnMut(&'s [Segment]) -> ObserverResult<()> + Send),
    ) -> LoopResult<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }
            match self.next_batch(cancel).await? {
                Some(batch) => callback(&batch).map_err(LoopError::Callback)?,
                None => return Ok(()),
            }
        }
    }
}

/// Factory of per-partition providers for one pass
#[async_trait]
pub trait RangeSplitter: Send + Sync {
    /// Create exactly one provider per partition. `parallelism` and
    /// `batch_size` are already normalised to at least 1.
    async fn create_ranges(
        &self,
        cancel: &CancellationToken,
        parallelism: usize,
        batch_size: usize,
    ) -> LoopResult<Vec<Box<dyn SegmentProvider>>>;
}

/// Provider over segments already held in memory
pub struct VecSegmentProvider {
    range: KeyspaceRange,
    segments: std::vec::IntoIter<Segment>,
    batch_size: usize,
}

impl VecSegmentProvider {
    pub fn new(range: KeyspaceRange, segments: Vec<Segment>, batch_size: usize) -> Self {
        Self {
            range,
            segments: segments.into_iter(),
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl SegmentProvider for VecSegmentProvider {
    fn range(&self) -> KeyspaceRange {
        self.range
    }

    async fn next_batch(
        &mut self,
        cancel: &CancellationToken,
    ) -> LoopResult<Option<Vec<Segment>>> {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        let batch: Vec<Segment> = self.segments.by_ref().take(self.batch_size).collect();
        Ok((!batch.is_empty()).then_some(batch))
    }
}

/// Rows assigned to one partition by [`bucket_by_stream`]
#[derive(Debug)]
pub struct StreamBucket<T> {
    pub range: KeyspaceRange,
    pub rows: Vec<T>,
}

/// Split rows into exactly `partitions` buckets without separating streams.
///
/// Rows are grouped by stream id and each group is sorted by position. Whole
/// groups are then assigned, in stream id order, to contiguous buckets of
/// roughly equal row counts, so the result is independent of input order.
/// Non-empty buckets report contiguous ranges derived from their first stream
/// id; empty buckets report the unbounded range.
pub fn bucket_by_stream<T>(
    rows: impl IntoIterator<Item = T>,
    key: impl Fn(&T) -> (Uuid, SegmentPosition),
    partitions: usize,
) -> Vec<StreamBucket<T>> {
    let partitions = partitions.max(1);

    let mut groups: BTreeMap<Uuid, Vec<T>> = BTreeMap::new();
    for row in rows {
        let (stream_id, _) = key(&row);
        groups.entry(stream_id).or_default().push(row);
    }
    let total: usize = groups.values().map(Vec::len).sum();

    let mut rows_per_bucket: Vec<Vec<T>> = (0..partitions).map(|_| Vec::new()).collect();
    let mut first_keys: Vec<Option<Uuid>> = vec![None; partitions];
    let mut bucket = 0;
    let mut assigned = 0usize;

    for (stream_id, mut group) in groups {
        // move on once the current bucket holds its share of the rows
        while bucket + 1 < partitions
            && !rows_per_bucket[bucket].is_empty()
            && (assigned as u128) * (partitions as u128)
                >= (total as u128) * (bucket as u128 + 1)
        {
            bucket += 1;
        }
        group.sort_by_key(|row| key(row).1);
        assigned += group.len();
        first_keys[bucket].get_or_insert(stream_id);
        rows_per_bucket[bucket].extend(group);
    }

    let occupied: Vec<usize> = (0..partitions).filter(|&i| first_keys[i].is_some()).collect();
    let mut ranges = vec![KeyspaceRange::full(); partitions];
    for (n, &i) in occupied.iter().enumerate() {
        let start = if n == 0 { None } else { first_keys[i] };
        let end = occupied.get(n + 1).and_then(|&next| first_keys[next]);
        ranges[i] = KeyspaceRange { start, end };
    }

    rows_per_bucket
        .into_iter()
        .zip(ranges)
        .map(|(rows, range)| StreamBucket { range, rows })
        .collect()
}

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::keyspace::KeyspaceRange;
use crate::rangeloop::provider::{
    RangeSplitter, SegmentProvider, VecSegmentProvider, bucket_by_stream,
};
use crate::rangeloop::segment::Segment;

/// Splitter over a fixed list of segments.
///
/// Segments of one stream always land in the same partition, in position
/// order. Exactly `parallelism` providers are returned, some possibly empty.
#[derive(Debug, Clone, Default)]
pub struct MemorySplitter {
    segments: Vec<Segment>,
}

impl MemorySplitter {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }
}

#[async_trait]
impl RangeSplitter for MemorySplitter {
    async fn create_ranges(
        &self,
        cancel: &CancellationToken,
        parallelism: usize,
        batch_size: usize,
    ) -> LoopResult<Vec<Box<dyn SegmentProvider>>> {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        let buckets = bucket_by_stream(
            self.segments.iter().cloned(),
            |segment| (segment.stream_id, segment.position),
            parallelism,
        );
        Ok(buckets
            .into_iter()
            .map(|bucket| {
                Box::new(VecSegmentProvider::new(bucket.range, bucket.rows, batch_size))
                    as Box<dyn SegmentProvider>
            })
            .collect())
    }
}

/// Splitter whose partitions never run out of segments
#[derive(Debug, Clone, Copy, Default)]
pub struct InfiniteSplitter;

#[async_trait]
impl RangeSplitter for InfiniteSplitter {
    async fn create_ranges(
        &self,
        _cancel: &CancellationToken,
        parallelism: usize,
        batch_size: usize,
    ) -> LoopResult<Vec<Box<dyn SegmentProvider>>> {
        Ok((0..parallelism.max(1))
            .map(|_| Box::new(InfiniteSegmentProvider::new(batch_size)) as Box<dyn SegmentProvider>)
            .collect())
    }
}

/// Returns full batches of default segments until cancelled
#[derive(Debug, Clone)]
pub struct InfiniteSegmentProvider {
    batch_size: usize,
}

impl InfiniteSegmentProvider {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl SegmentProvider for InfiniteSegmentProvider {
    fn range(&self) -> KeyspaceRange {
        KeyspaceRange::full()
    }

    async fn next_batch(&mut self, cancel: &CancellationToken) -> LoopResult<Option<Vec<Segment>>> {
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        Ok(Some(vec![Segment::default(); self.batch_size]))
    }
}

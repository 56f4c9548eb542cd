//! Live segment counter
//!
//! Counts segments as they are processed so progress can be read while a pass
//! is still running. With a [`SegmentCounter`] attached it also compares the
//! processed total against the store's own count taken at start and finish,
//! and fails the pass for this observer when the numbers disagree too much.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::rangeloop::observer::{Observer, ObserverResult, Partial};
use crate::rangeloop::segment::Segment;

/// Differences smaller than this are never suspicious
const MINIMUM_DELTA: u64 = 100;

/// Source of an independent segment count
#[async_trait]
pub trait SegmentCounter: Send + Sync {
    async fn count_segments(&self, cancel: &CancellationToken) -> ObserverResult<u64>;
}

pub struct LiveCountObserver {
    counter: Option<Arc<dyn SegmentCounter>>,
    suspicious_processed_ratio: f64,
    processed: Arc<AtomicU64>,
    count_at_start: Mutex<Option<u64>>,
}

impl LiveCountObserver {
    /// Count only, without verification
    pub fn new() -> Self {
        Self {
            counter: None,
            suspicious_processed_ratio: 0.0,
            processed: Arc::new(AtomicU64::new(0)),
            count_at_start: Mutex::new(None),
        }
    }

    /// Count and verify against `counter` at the end of every pass
    pub fn with_verification(
        counter: Arc<dyn SegmentCounter>,
        suspicious_processed_ratio: f64,
    ) -> Self {
        Self {
            counter: Some(counter),
            suspicious_processed_ratio,
            ..Self::new()
        }
    }

    /// Segments processed so far in the current pass
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn set_count_at_start(&self, count: Option<u64>) {
        match self.count_at_start.lock() {
            Ok(mut slot) => *slot = count,
            Err(poisoned) => *poisoned.into_inner() = count,
        }
    }

    fn count_at_start(&self) -> Option<u64> {
        match self.count_at_start.lock() {
            Ok(slot) => *slot,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Observer for LiveCountObserver {
    async fn start(
        &self,
        cancel: &CancellationToken,
        _pass_start: DateTime<Utc>,
    ) -> ObserverResult<()> {
        self.processed.store(0, Ordering::Relaxed);
        let before = match &self.counter {
            Some(counter) => Some(counter.count_segments(cancel).await?),
            None => None,
        };
        self.set_count_at_start(before);
        Ok(())
    }

    async fn fork(&self, _cancel: &CancellationToken) -> ObserverResult<Box<dyn Partial>> {
        Ok(Box::new(LiveCountPartial {
            processed: Arc::clone(&self.processed),
        }))
    }

    async fn join(
        &self,
        _cancel: &CancellationToken,
        _partial: Box<dyn Partial>,
    ) -> ObserverResult<()> {
        // partials already added to the shared counter
        Ok(())
    }

    async fn finish(&self, cancel: &CancellationToken) -> ObserverResult<()> {
        let processed = self.processed();
        let (Some(counter), Some(before)) = (&self.counter, self.count_at_start()) else {
            info!("Live count: {} segments processed", processed);
            return Ok(());
        };

        let after = counter.count_segments(cancel).await?;
        info!(
            "Live count: {} segments processed, store reported {} before and {} after",
            processed, before, after
        );
        verify_count(before, after, processed, self.suspicious_processed_ratio)
    }
}

struct LiveCountPartial {
    processed: Arc<AtomicU64>,
}

#[async_trait]
impl Partial for LiveCountPartial {
    async fn process(
        &mut self,
        _cancel: &CancellationToken,
        segments: &[Segment],
    ) -> ObserverResult<()> {
        self.processed.fetch_add(segments.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Check `processed` against the counts taken before and after the pass.
///
/// Rows may be added or removed during a pass, so anything between the two
/// counts is fine. Outside of them, a difference of fewer than 100 rows is
/// tolerated; above that the difference relative to the nearest bound must
/// not exceed `suspicious_ratio`.
pub fn verify_count(
    before: u64,
    after: u64,
    processed: u64,
    suspicious_ratio: f64,
) -> ObserverResult<()> {
    let (low, high) = if before <= after { (before, after) } else { (after, before) };

    let (delta, ratio) = if processed < low {
        let delta = low - processed;
        (delta, delta as f64 / (low as f64 + 1.0))
    } else if processed > high {
        let delta = processed - high;
        (delta, delta as f64 / (high as f64 + 1.0))
    } else {
        (0, 0.0)
    };

    if delta < MINIMUM_DELTA || ratio <= suspicious_ratio {
        return Ok(());
    }

    warn!(
        "Processed count looks suspicious: before={} after={} processed={} ratio={:.4}",
        before, after, processed, ratio
    );
    Err(format!(
        "processed count looks suspicious: before:{} after:{} processed:{} ratio:{} threshold:{}",
        before, after, processed, ratio, suspicious_ratio
    )
    .into())
}

#[cfg(feature = "rocksdb")]
#[async_trait]
impl SegmentCounter for crate::rangeloop::provider::RocksSegmentStore {
    async fn count_segments(&self, _cancel: &CancellationToken) -> ObserverResult<u64> {
        let store = self.clone();
        let count = tokio::task::spawn_blocking(move || store.exact_segment_count()).await??;
        Ok(count)
    }
}

//! Observer lifecycle traits
//!
//! An [`Observer`] is a long-lived analysis that runs once per pass. For every
//! partition the service forks a [`Partial`], feeds it that partition's
//! batches, and joins it back once all partitions are done:
//!
//! ```text
//! start ──> fork (× partitions) ──> process (× batches) ──> join (× partials) ──> finish
//! ```
//!
//! A failing call only removes that observer (or for `fork`/`process` that
//! observer's partition) from the pass. Other observers continue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::rangeloop::segment::Segment;

/// Result type of observer and partial callbacks
pub type ObserverResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A pluggable analysis driven by the ranged loop.
///
/// Observers are shared across passes and across partition tasks, so every
/// method takes `&self`; implementations keep their aggregate state behind
/// their own locks. `fork` and `join` are never called concurrently for the
/// same observer.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Identity used in logs and metrics
    fn name(&self) -> String {
        short_type_name(std::any::type_name::<Self>()).to_string()
    }

    /// Prepare for a new pass. Failing excludes the observer from the pass.
    async fn start(
        &self,
        cancel: &CancellationToken,
        pass_start: DateTime<Utc>,
    ) -> ObserverResult<()>;

    /// Create the state for one partition
    async fn fork(&self, cancel: &CancellationToken) -> ObserverResult<Box<dyn Partial>>;

    /// Merge one partition's state back. Called after every partition has
    /// finished, once per successful fork, in no particular order.
    async fn join(
        &self,
        cancel: &CancellationToken,
        partial: Box<dyn Partial>,
    ) -> ObserverResult<()>;

    /// Finalize the pass after all joins
    async fn finish(&self, cancel: &CancellationToken) -> ObserverResult<()>;
}

/// Per-partition state of an observer.
///
/// A partial only ever sees the batches of its own partition and is never
/// called concurrently with itself.
#[async_trait]
pub trait Partial: Send {
    async fn process(
        &mut self,
        cancel: &CancellationToken,
        segments: &[Segment],
    ) -> ObserverResult<()>;

    /// Hand the partial back as `Any` so `join` can recover its concrete type
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

/// Recover the concrete type of a partial inside `Observer::join`
pub fn downcast_partial<T: Partial + 'static>(partial: Box<dyn Partial>) -> ObserverResult<T> {
    partial
        .into_any()
        .downcast::<T>()
        .map(|partial| *partial)
        .map_err(|_| {
            format!(
                "expected partial of type {}",
                std::any::type_name::<T>()
            )
            .into()
        })
}

/// Outcome of one observer for one pass
#[derive(Debug, Clone, PartialEq)]
pub struct ObserverDuration {
    pub observer: String,
    /// Summed processing time across partitions, `None` when the observer
    /// failed at any step of the pass
    pub duration: Option<Duration>,
}

impl ObserverDuration {
    /// Value reported to metrics when the observer failed
    pub const FAILED_SECONDS: f64 = -1.0;

    pub fn succeeded(observer: impl Into<String>, duration: Duration) -> Self {
        Self {
            observer: observer.into(),
            duration: Some(duration),
        }
    }

    pub fn failed(observer: impl Into<String>) -> Self {
        Self {
            observer: observer.into(),
            duration: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.duration.is_none()
    }

    pub fn seconds(&self) -> f64 {
        self.duration
            .map_or(Self::FAILED_SECONDS, |duration| duration.as_secs_f64())
    }
}

impl fmt::Display for ObserverDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.duration {
            Some(duration) => write!(f, "{}: {:?}", self.observer, duration),
            None => write!(f, "{}: failed", self.observer),
        }
    }
}

/// `a::b::Type<c::D>` -> `Type<c::D>`
fn short_type_name(full: &str) -> &str {
    let head_end = full.find('<').unwrap_or(full.len());
    match full[..head_end].rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

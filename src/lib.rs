//! # rangeloop
//!
//! A partitioned, concurrent fork/join scanner over segment metadata. One pass
//! splits the segment keyspace into ranges, walks every range in parallel and
//! lets many independent analyses ("observers") share that single physical scan.
//!
//! ## Features
//!
//! - **Keyspace Splitting**: Exact, deterministic division of the 128-bit stream id space
//! - **Fork/Join Observers**: Map (`fork` + `process`) and reduce (`join` + `finish`) per pass
//! - **Failure Containment**: One failing observer never aborts the others
//! - **Pluggable Backends**: RocksDB range scans and Avro export files
//! - **Cancellation**: A single pass-scoped token threaded through every call
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rangeloop::testkit::{CountObserver, MemorySplitter};
//! use rangeloop::{LoopConfig, Observer, Segment, Service};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let counter = Arc::new(CountObserver::new());
//!     let service = Service::new(
//!         LoopConfig::default().with_parallelism(4),
//!         Arc::new(MemorySplitter::new(vec![Segment::default(); 10])),
//!         vec![counter.clone() as Arc<dyn Observer>],
//!     );
//!
//!     let durations = service.run_once(&CancellationToken::new()).await?;
//!     println!("{} segments, {:?}", counter.num_segments(), durations);
//!     Ok(())
//! }
//! ```

#![allow(clippy::derivable_impls)]
#![allow(clippy::new_without_default)]

pub mod rangeloop;

pub use rangeloop::{
    // Configuration
    config::LoopConfig,
    // Errors
    error::{LoopError, LoopResult},
    // Keyspace
    keyspace::{KeyspaceRange, compute_boundaries, compute_ranges},
    // Observers
    observer::{Observer, ObserverDuration, ObserverResult, Partial, downcast_partial},
    provider::{RangeSplitter, SegmentProvider},
    // Segment model
    segment::{Segment, SegmentPosition},
    sequence::SequenceObserver,
    // Orchestration
    service::Service,
};

pub use rangeloop::testkit;

//! Ranged segment loop
//!
//! The loop walks every segment once per pass. The keyspace is split into
//! ranges, every range is iterated by its own task, and each batch of segments
//! is fanned out to one [`observer::Partial`] per registered observer. When all
//! ranges are done the partials are joined back into their observers.
//!
//! ## Architecture
//!
//! - **keyspace**: Range math over the 128-bit stream id space
//! - **segment**: The row record handed to observers
//! - **provider**: `RangeSplitter`/`SegmentProvider` backends (RocksDB, Avro)
//! - **observer**: The `Observer`/`Partial` lifecycle contract
//! - **service**: Drives one pass (start, fork, process, join, finish)
//! - **sequence**: Runs one of several expensive observers per pass
//! - **metrics**: Last completed pass, exported through Prometheus
//! - **live_count**: Built-in observer counting segments while a pass runs
//! - **shutdown**: SIGINT/SIGTERM cancel the pass token
//! - **testkit**: In-memory splitters and recording observers for tests

pub mod config;
pub mod error;
pub mod keyspace;
pub mod live_count;
pub mod metrics;
pub mod node_alias;
pub mod observer;
pub mod provider;
pub mod segment;
pub mod sequence;
pub mod service;
pub mod shutdown;
pub mod testkit;

pub use config::LoopConfig;
pub use error::{LoopError, LoopResult};
pub use keyspace::KeyspaceRange;
pub use live_count::{LiveCountObserver, SegmentCounter};
pub use metrics::PassMetricsRegistry;
pub use node_alias::NodeAliasMap;
pub use observer::{Observer, ObserverDuration, ObserverResult, Partial};
pub use provider::{RangeSplitter, SegmentProvider};
pub use segment::Segment;
pub use sequence::SequenceObserver;
pub use service::Service;

//! Loop error types with context preservation
//!
//! Only infrastructure failures (a backend that cannot iterate, malformed
//! source data, a crashed partition task) and cancellation travel as
//! [`LoopError`]. Observer failures stay inside the pass and are reported as
//! failed [`ObserverDuration`](super::observer::ObserverDuration)s instead.

use crate::rangeloop::keyspace::KeyspaceRange;

/// Result alias used throughout the loop.
pub type LoopResult<T> = Result<T, LoopError>;

/// Main error type for ranged loop passes
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// The pass-scoped cancellation token fired
    #[error("ranged loop pass cancelled")]
    Cancelled,

    /// Iterating one partition failed
    #[error("partition {partition} ({range}) failed: {source}")]
    Partition {
        partition: usize,
        range: KeyspaceRange,
        #[source]
        source: Box<LoopError>,
    },

    /// A stored or exported row could not be decoded
    #[error("malformed segment record: {reason}")]
    MalformedRecord { reason: String },

    /// Reading an Avro object container file failed
    #[error("avro export error: {message}")]
    Avro { message: String },

    /// The RocksDB backend returned an error
    #[cfg(feature = "rocksdb")]
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Filesystem access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration or missing backend resources
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A provider's background worker went away before answering
    #[error("segment provider closed: {reason}")]
    ProviderClosed { reason: String },

    /// A spawned partition task panicked or was aborted
    #[error("partition task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// A batch callback passed to `SegmentProvider::iterate` failed
    #[error("batch callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LoopError {
    /// Create a malformed record error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            reason: reason.into(),
        }
    }

    /// Create an Avro error from any displayable cause
    pub fn avro(context: &str, cause: impl std::fmt::Display) -> Self {
        Self::Avro {
            message: format!("{}: {}", context, cause),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap an error with the partition it happened in
    pub fn in_partition(self, partition: usize, range: KeyspaceRange) -> Self {
        match self {
            // cancellation stays recognisable at the top level
            Self::Cancelled => Self::Cancelled,
            other => Self::Partition {
                partition,
                range,
                source: Box::new(other),
            },
        }
    }

    /// Whether this error, or the partition error it wraps, is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Partition { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

//! Test helpers for observers and the loop itself
//!
//! Everything here runs without a database: [`MemorySplitter`] serves a fixed
//! set of segments, [`InfiniteSplitter`] never runs out, and the observers
//! record what the loop did to them.
//!
//! ```rust
//! use rangeloop::testkit::{self, CountObserver, MemorySplitter};
//! use rangeloop::{LoopConfig, Observer, Service};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let segments = (0..10).map(|i| testkit::segment(i % 3, i as u32)).collect();
//! let counter = Arc::new(CountObserver::new());
//! let service = Service::new(
//!     LoopConfig::default().with_parallelism(3).with_batch_size(2),
//!     Arc::new(MemorySplitter::new(segments)),
//!     vec![counter.clone() as Arc<dyn Observer>],
//! );
//! service.run_once(&CancellationToken::new()).await.unwrap();
//! assert_eq!(counter.num_segments(), 10);
//! # }
//! ```

mod avro_fixtures;
mod observers;
mod splitters;

pub use avro_fixtures::{node_aliases_avro, segment_fields, segments_avro, write_avro};
pub use observers::{CallbackObserver, CountObserver, SleepObserver};
pub use splitters::{InfiniteSegmentProvider, InfiniteSplitter, MemorySplitter};

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::rangeloop::segment::{
    AliasPiece, NodeId, PieceId, RedundancyScheme, Segment, SegmentPosition,
};

/// Fixed creation time of generated segments
pub fn created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Inline segment `index` of the stream with id `stream`
pub fn segment(stream: u128, index: u32) -> Segment {
    Segment {
        stream_id: Uuid::from_u128(stream),
        position: SegmentPosition::new(0, index),
        created_at: created_at(),
        encrypted_size: 1024,
        plain_size: 1000,
        ..Segment::default()
    }
}

/// Remote segment stored as 29-of-80 pieces, one per `(piece number, alias)`
pub fn remote_segment(stream: u128, index: u32, pieces: &[(u16, u32)]) -> Segment {
    let mut root_piece_id = [0u8; 32];
    root_piece_id[..16].copy_from_slice(&stream.to_be_bytes());
    root_piece_id[28..].copy_from_slice(&index.to_be_bytes());

    Segment {
        root_piece_id: PieceId(root_piece_id),
        encrypted_size: 29 * 256 * 4,
        redundancy: RedundancyScheme {
            algorithm: 1,
            share_size: 256,
            required_shares: 29,
            repair_shares: 35,
            optimal_shares: 65,
            total_shares: 80,
        },
        alias_pieces: pieces
            .iter()
            .map(|&(number, alias)| AliasPiece { number, alias })
            .collect(),
        ..segment(stream, index)
    }
}

/// Node id whose bytes are all `fill`
pub fn node_id(fill: u8) -> NodeId {
    NodeId([fill; 32])
}

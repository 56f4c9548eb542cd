//! RocksDB backend
//!
//! Segments live in the `segments` column family keyed by
//! `stream_id (16 bytes) | position (8 bytes BE)`, so a stream id range maps
//! directly onto a key range. Each partition scans its range in batches,
//! resuming after the last key it returned.
//!
//! Reads may be pinned to a snapshot. With a non-zero `snapshot_max_age` each
//! partition takes its own snapshot on the first batch and replaces it once it
//! is older than the limit, so partitions can see slightly different states.
//! A zero age reads the latest committed state for every batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, trace};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, ReadOptions,
    WriteBatch,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::keyspace::{KeyspaceRange, compute_ranges};
use crate::rangeloop::node_alias::NodeAliasMap;
use crate::rangeloop::provider::{RangeSplitter, SegmentProvider};
use crate::rangeloop::segment::{
    NodeId, PieceId, RedundancyScheme, Segment, SegmentPosition, SegmentSource,
    decode_alias_pieces, decode_row_key, encode_alias_pieces, encode_row_key,
};

const CF_SEGMENTS: &str = "segments";
const CF_NODE_ALIASES: &str = "node_aliases";

/// Value stored under a segment row key
#[derive(Debug, Serialize, Deserialize)]
struct StoredSegment {
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    repaired_at: Option<DateTime<Utc>>,
    root_piece_id: PieceId,
    encrypted_size: i32,
    plain_offset: i64,
    plain_size: i32,
    redundancy: i64,
    placement: u16,
    remote_alias_pieces: Vec<u8>,
}

impl StoredSegment {
    fn from_segment(segment: &Segment) -> Self {
        Self {
            created_at: segment.created_at,
            expires_at: segment.expires_at,
            repaired_at: segment.repaired_at,
            root_piece_id: segment.root_piece_id,
            encrypted_size: segment.encrypted_size,
            plain_offset: segment.plain_offset,
            plain_size: segment.plain_size,
            redundancy: segment.redundancy.pack(),
            placement: segment.placement,
            remote_alias_pieces: encode_alias_pieces(&segment.alias_pieces),
        }
    }

    fn into_segment(
        self,
        stream_id: Uuid,
        position: SegmentPosition,
        aliases: &NodeAliasMap,
    ) -> LoopResult<Segment> {
        let alias_pieces = decode_alias_pieces(&self.remote_alias_pieces)?;
        let pieces = aliases.resolve(&alias_pieces)?;
        Ok(Segment {
            stream_id,
            position,
            created_at: self.created_at,
            expires_at: self.expires_at,
            repaired_at: self.repaired_at,
            root_piece_id: self.root_piece_id,
            encrypted_size: self.encrypted_size,
            plain_offset: self.plain_offset,
            plain_size: self.plain_size,
            redundancy: RedundancyScheme::unpack(self.redundancy),
            placement: self.placement,
            alias_pieces,
            pieces,
            source: SegmentSource::RocksDb,
        })
    }
}

fn decode_row(key: &[u8], value: &[u8], aliases: &NodeAliasMap) -> LoopResult<Segment> {
    let (stream_id, position) = decode_row_key(key)?;
    let stored: StoredSegment = serde_json::from_slice(value)
        .map_err(|e| LoopError::malformed(format!("segment {} {:?}: {}", stream_id, position, e)))?;
    stored.into_segment(stream_id, position, aliases)
}

fn column_family<'a>(db: &'a DB, name: &str) -> LoopResult<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| LoopError::configuration(format!("missing column family {}", name)))
}

/// Segment metadata stored in RocksDB
#[derive(Clone)]
pub struct RocksSegmentStore {
    db: Arc<DB>,
}

impl RocksSegmentStore {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>) -> LoopResult<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_SEGMENTS, Options::default()),
            ColumnFamilyDescriptor::new(CF_NODE_ALIASES, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&options, path.as_ref(), cfs)?;
        info!("Opened segment store at {}", path.as_ref().display());
        Ok(Self { db: Arc::new(db) })
    }

    pub fn put_segments(&self, segments: &[Segment]) -> LoopResult<()> {
        let cf = column_family(&self.db, CF_SEGMENTS)?;
        let mut batch = WriteBatch::default();
        for segment in segments {
            let value = serde_json::to_vec(&StoredSegment::from_segment(segment))
                .map_err(|e| LoopError::malformed(format!("encode segment: {}", e)))?;
            batch.put_cf(cf, segment.row_key(), value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn put_node_aliases(
        &self,
        aliases: impl IntoIterator<Item = (u32, NodeId)>,
    ) -> LoopResult<()> {
        let cf = column_family(&self.db, CF_NODE_ALIASES)?;
        let mut batch = WriteBatch::default();
        for (alias, node) in aliases {
            batch.put_cf(cf, alias.to_be_bytes(), node.as_bytes());
        }
        self.db.write(batch)?;
        Ok(())
    }

    pub fn delete_segment(&self, stream_id: &Uuid, position: SegmentPosition) -> LoopResult<()> {
        let cf = column_family(&self.db, CF_SEGMENTS)?;
        self.db.delete_cf(cf, encode_row_key(stream_id, position))?;
        Ok(())
    }

    /// RocksDB's own key count estimate; cheap but approximate
    pub fn estimated_segment_count(&self) -> LoopResult<u64> {
        let cf = column_family(&self.db, CF_SEGMENTS)?;
        Ok(self
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    /// Count by scanning the whole column family
    pub fn exact_segment_count(&self) -> LoopResult<u64> {
        let cf = column_family(&self.db, CF_SEGMENTS)?;
        let mut count = 0;
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    pub fn load_node_aliases(&self) -> LoopResult<NodeAliasMap> {
        let cf = column_family(&self.db, CF_NODE_ALIASES)?;
        let mut aliases = NodeAliasMap::new();
        for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = entry?;
            let alias = <[u8; 4]>::try_from(&key[..]).map_err(|_| {
                LoopError::malformed(format!("node alias key must be 4 bytes, got {}", key.len()))
            })?;
            aliases.insert(u32::from_be_bytes(alias), NodeId::from_bytes(&value)?);
        }
        Ok(aliases)
    }
}

/// Splits the store by stream id into `parallelism` key ranges
pub struct RocksRangeSplitter {
    store: RocksSegmentStore,
    snapshot_max_age: Duration,
}

impl RocksRangeSplitter {
    pub fn new(store: RocksSegmentStore, snapshot_max_age: Duration) -> Self {
        Self {
            store,
            snapshot_max_age,
        }
    }
}

#[async_trait]
impl RangeSplitter for RocksRangeSplitter {
    async fn create_ranges(
        &self,
        cancel: &CancellationToken,
        parallelism: usize,
        batch_size: usize,
    ) -> LoopResult<Vec<Box<dyn SegmentProvider>>> {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        let store = self.store.clone();
        let aliases =
            Arc::new(tokio::task::spawn_blocking(move || store.load_node_aliases()).await??);
        debug!("Loaded {} node aliases", aliases.len());

        let partitions = u32::try_from(parallelism).unwrap_or(u32::MAX);
        Ok(compute_ranges(partitions)
            .into_iter()
            .map(|range| {
                Box::new(RocksSegmentProvider {
                    scan: Some(RangeScan {
                        db: Arc::clone(&self.store.db),
                        aliases: Arc::clone(&aliases),
                        cursor: range
                            .start
                            .map(|start| start.as_bytes().to_vec())
                            .unwrap_or_default(),
                        upper_bound: range.end.map(|end| end.as_bytes().to_vec()),
                        batch_size: batch_size.max(1),
                        snapshot_max_age: self.snapshot_max_age,
                    }),
                    range,
                    worker: None,
                    exhausted: false,
                }) as Box<dyn SegmentProvider>
            })
            .collect())
    }
}

type BatchReply = oneshot::Sender<LoopResult<Vec<Segment>>>;

/// One partition of the store.
///
/// The scan runs on a dedicated blocking thread which owns the snapshot; the
/// provider sends it one request per batch. Dropping the provider closes the
/// request channel, which ends the thread and releases the snapshot.
pub struct RocksSegmentProvider {
    range: KeyspaceRange,
    scan: Option<RangeScan>,
    worker: Option<mpsc::Sender<BatchReply>>,
    exhausted: bool,
}

impl RocksSegmentProvider {
    fn worker(&mut self) -> LoopResult<&mpsc::Sender<BatchReply>> {
        if self.worker.is_none() {
            let scan = self.scan.take().ok_or_else(|| LoopError::ProviderClosed {
                reason: "range scan already consumed".to_string(),
            })?;
            let (sender, receiver) = mpsc::channel(1);
            tokio::task::spawn_blocking(move || scan.serve(receiver));
            self.worker = Some(sender);
        }
        self.worker.as_ref().ok_or_else(|| LoopError::ProviderClosed {
            reason: "range scan worker missing".to_string(),
        })
    }
}

#[async_trait]
impl SegmentProvider for RocksSegmentProvider {
    fn range(&self) -> KeyspaceRange {
        self.range
    }

    async fn next_batch(&mut self, cancel: &CancellationToken) -> LoopResult<Option<Vec<Segment>>> {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        if self.exhausted {
            return Ok(None);
        }

        let range = self.range;
        let (reply, response) = oneshot::channel();
        self.worker()?
            .send(reply)
            .await
            .map_err(|_| LoopError::ProviderClosed {
                reason: format!("scan worker for {} stopped", range),
            })?;
        let batch = response.await.map_err(|_| LoopError::ProviderClosed {
            reason: format!("scan worker for {} dropped the request", range),
        })??;

        if batch.is_empty() {
            self.exhausted = true;
            self.worker = None;
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

/// State of one partition's scan, owned by its worker thread
struct RangeScan {
    db: Arc<DB>,
    aliases: Arc<NodeAliasMap>,
    cursor: Vec<u8>,
    upper_bound: Option<Vec<u8>>,
    batch_size: usize,
    snapshot_max_age: Duration,
}

impl RangeScan {
    fn serve(mut self, mut requests: mpsc::Receiver<BatchReply>) {
        let db = Arc::clone(&self.db);
        let mut snapshot: Option<(Instant, rocksdb::Snapshot<'_>)> = None;

        while let Some(reply) = requests.blocking_recv() {
            if !self.snapshot_max_age.is_zero() {
                let stale = snapshot
                    .as_ref()
                    .map_or(true, |(taken, _)| taken.elapsed() >= self.snapshot_max_age);
                if stale {
                    trace!("Pinning new snapshot for scan at {:?}", self.cursor);
                    snapshot = Some((Instant::now(), db.snapshot()));
                }
            }

            let mut read_options = ReadOptions::default();
            if let Some((_, snapshot)) = &snapshot {
                read_options.set_snapshot(snapshot);
            }
            if let Some(upper_bound) = &self.upper_bound {
                read_options.set_iterate_upper_bound(upper_bound.clone());
            }

            // the receiver only goes away when the provider was dropped
            let _ = reply.send(self.fetch(&db, read_options));
        }
    }

    fn fetch(&mut self, db: &DB, read_options: ReadOptions) -> LoopResult<Vec<Segment>> {
        let cf = column_family(db, CF_SEGMENTS)?;
        let iter = db.iterator_cf_opt(
            cf,
            read_options,
            IteratorMode::From(&self.cursor, Direction::Forward),
        );

        let mut batch = Vec::with_capacity(self.batch_size);
        for entry in iter.take(self.batch_size) {
            let (key, value) = entry?;
            batch.push(decode_row(&key, &value, &self.aliases)?);
            // smallest key strictly greater than the one just read
            self.cursor.clear();
            self.cursor.extend_from_slice(&key);
            self.cursor.push(0);
        }
        Ok(batch)
    }
}

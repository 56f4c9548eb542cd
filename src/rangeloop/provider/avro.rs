//! Avro export backend
//!
//! An export is a set of Avro object container files holding segment rows,
//! plus a second set holding the node alias dictionary. Container files
//! cannot be range-scanned, so the splitter reads the whole export once,
//! groups the rows by stream id and hands each partition a contiguous run of
//! whole streams. Full field decoding is deferred to the partition that owns
//! the row, so a malformed row fails only that partition.

use apache_avro::Reader;
use apache_avro::types::Value as AvroValue;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::keyspace::KeyspaceRange;
use crate::rangeloop::node_alias::NodeAliasMap;
use crate::rangeloop::provider::{RangeSplitter, SegmentProvider, bucket_by_stream};
use crate::rangeloop::segment::{
    NodeId, PieceId, RedundancyScheme, Segment, SegmentPosition, SegmentSource,
    decode_alias_pieces,
};

/// Writer schema of segment export files. Readers accept any schema that
/// carries these field names; nullable fields may also be bare.
pub const SEGMENT_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "segment",
    "fields": [
        {"name": "stream_id", "type": "bytes"},
        {"name": "position", "type": "long"},
        {"name": "created_at", "type": "string"},
        {"name": "expires_at", "type": ["null", "string"]},
        {"name": "repaired_at", "type": ["null", "string"]},
        {"name": "root_piece_id", "type": "bytes"},
        {"name": "encrypted_size", "type": "long"},
        {"name": "plain_offset", "type": "long"},
        {"name": "plain_size", "type": "long"},
        {"name": "remote_alias_pieces", "type": ["null", "bytes"]},
        {"name": "redundancy", "type": "long"},
        {"name": "placement", "type": ["null", "long"]}
    ]
}
"#;

/// Writer schema of node alias export files
pub const NODE_ALIAS_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "node_alias",
    "fields": [
        {"name": "node_id", "type": "bytes"},
        {"name": "node_alias", "type": "long"}
    ]
}
"#;

/// The files making up one export
pub trait AvroSource: Send + Sync {
    /// Human readable location for logs
    fn describe(&self) -> String;

    /// Open every file of the export, in a stable order. Called once per pass.
    fn open(&self) -> LoopResult<Vec<Box<dyn Read + Send>>>;
}

/// Export files on local disk matched by `dir/prefix*suffix`
#[derive(Debug, Clone)]
pub struct AvroFileSource {
    pattern: PathBuf,
}

impl AvroFileSource {
    pub fn new(pattern: impl Into<PathBuf>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Files matching the pattern, sorted by name.
    ///
    /// Only the file name part may contain a single `*`.
    pub fn files(&self) -> LoopResult<Vec<PathBuf>> {
        let parent = match self.pattern.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file_pattern = self
            .pattern
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| {
                LoopError::configuration(format!(
                    "invalid Avro file pattern: {}",
                    self.pattern.display()
                ))
            })?;

        let parts: Vec<&str> = file_pattern.split('*').collect();
        if parts.len() > 2 {
            return Err(LoopError::configuration(format!(
                "Avro file pattern supports a single '*': {}",
                file_pattern
            )));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(parent)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let matches = match parts.as_slice() {
                [prefix, suffix] => {
                    name.len() >= prefix.len() + suffix.len()
                        && name.starts_with(prefix)
                        && name.ends_with(suffix)
                }
                _ => name == file_pattern,
            };
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl AvroSource for AvroFileSource {
    fn describe(&self) -> String {
        self.pattern.display().to_string()
    }

    fn open(&self) -> LoopResult<Vec<Box<dyn Read + Send>>> {
        self.files()?
            .into_iter()
            .map(|path| {
                let file = File::open(&path)?;
                Ok(Box::new(BufReader::new(file)) as Box<dyn Read + Send>)
            })
            .collect()
    }
}

/// Export held in memory, one buffer per container file
#[derive(Debug, Clone, Default)]
pub struct InMemoryAvroSource {
    files: Vec<Arc<Vec<u8>>>,
}

impl InMemoryAvroSource {
    pub fn new(files: Vec<Vec<u8>>) -> Self {
        Self {
            files: files.into_iter().map(Arc::new).collect(),
        }
    }
}

struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AvroSource for InMemoryAvroSource {
    fn describe(&self) -> String {
        format!("{} in-memory file(s)", self.files.len())
    }

    fn open(&self) -> LoopResult<Vec<Box<dyn Read + Send>>> {
        Ok(self
            .files
            .iter()
            .map(|bytes| {
                Box::new(Cursor::new(SharedBytes(Arc::clone(bytes)))) as Box<dyn Read + Send>
            })
            .collect())
    }
}

/// Splits an Avro export into partitions of whole streams
pub struct AvroSegmentsSplitter {
    segments: Arc<dyn AvroSource>,
    node_aliases: Arc<dyn AvroSource>,
}

impl AvroSegmentsSplitter {
    pub fn new(segments: Arc<dyn AvroSource>, node_aliases: Arc<dyn AvroSource>) -> Self {
        Self {
            segments,
            node_aliases,
        }
    }
}

#[async_trait]
impl RangeSplitter for AvroSegmentsSplitter {
    async fn create_ranges(
        &self,
        cancel: &CancellationToken,
        parallelism: usize,
        batch_size: usize,
    ) -> LoopResult<Vec<Box<dyn SegmentProvider>>> {
        let segments = Arc::clone(&self.segments);
        let node_aliases = Arc::clone(&self.node_aliases);
        let cancel = cancel.clone();

        let (aliases, buckets) = tokio::task::spawn_blocking(move || {
            let aliases = read_node_aliases(node_aliases.as_ref(), &cancel)?;
            let records = read_segment_records(segments.as_ref(), &cancel)?;
            info!(
                "Loaded {} segment rows and {} node aliases from {}",
                records.len(),
                aliases.len(),
                segments.describe()
            );
            let buckets = bucket_by_stream(
                records,
                |record| (record.stream_id, record.position),
                parallelism,
            );
            Ok::<_, LoopError>((aliases, buckets))
        })
        .await??;

        let aliases = Arc::new(aliases);
        Ok(buckets
            .into_iter()
            .enumerate()
            .map(|(partition, bucket)| {
                debug!(
                    "Avro partition {} covers {} rows in {}",
                    partition,
                    bucket.rows.len(),
                    bucket.range
                );
                Box::new(AvroSegmentProvider {
                    range: bucket.range,
                    records: bucket.rows.into_iter(),
                    aliases: Arc::clone(&aliases),
                    batch_size: batch_size.max(1),
                }) as Box<dyn SegmentProvider>
            })
            .collect())
    }
}

/// One partition of an Avro export
pub struct AvroSegmentProvider {
    range: KeyspaceRange,
    records: std::vec::IntoIter<RawRecord>,
    aliases: Arc<NodeAliasMap>,
    batch_size: usize,
}

#[async_trait]
impl SegmentProvider for AvroSegmentProvider {
    fn range(&self) -> KeyspaceRange {
        self.range
    }

    async fn next_batch(&mut self, cancel: &CancellationToken) -> LoopResult<Option<Vec<Segment>>> {
        if cancel.is_cancelled() {
            return Err(LoopError::Cancelled);
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        for record in self.records.by_ref().take(self.batch_size) {
            batch.push(record.decode(&self.aliases)?);
        }
        Ok((!batch.is_empty()).then_some(batch))
    }
}

/// A segment row with only its grouping key decoded
struct RawRecord {
    stream_id: Uuid,
    position: SegmentPosition,
    fields: Vec<(String, AvroValue)>,
}

impl RawRecord {
    fn from_value(value: AvroValue) -> LoopResult<Self> {
        let AvroValue::Record(fields) = value else {
            return Err(LoopError::malformed("segment row is not an Avro record"));
        };
        let stream_id = match bytes_field(&fields, "stream_id")? {
            Some(bytes) => Uuid::from_slice(bytes)
                .map_err(|e| LoopError::malformed(format!("stream_id: {}", e)))?,
            None => return Err(LoopError::malformed("stream_id is missing")),
        };
        let position = SegmentPosition::from_encoded(long_field(&fields, "position")? as u64);
        Ok(Self {
            stream_id,
            position,
            fields,
        })
    }

    fn decode(self, aliases: &NodeAliasMap) -> LoopResult<Segment> {
        let fields = &self.fields;

        let root_piece_id = match bytes_field(fields, "root_piece_id")? {
            Some(bytes) => PieceId::from_bytes(bytes)?,
            None => PieceId::default(),
        };
        let alias_pieces = match bytes_field(fields, "remote_alias_pieces")? {
            Some(bytes) => decode_alias_pieces(bytes)?,
            None => Vec::new(),
        };
        let pieces = aliases.resolve(&alias_pieces)?;

        Ok(Segment {
            stream_id: self.stream_id,
            position: self.position,
            created_at: time_field(fields, "created_at")?.unwrap_or_default(),
            expires_at: time_field(fields, "expires_at")?,
            repaired_at: time_field(fields, "repaired_at")?,
            root_piece_id,
            encrypted_size: narrow(long_field(fields, "encrypted_size")?, "encrypted_size")?,
            plain_offset: long_field(fields, "plain_offset")?,
            plain_size: narrow(long_field(fields, "plain_size")?, "plain_size")?,
            redundancy: RedundancyScheme::unpack(long_field(fields, "redundancy")?),
            placement: narrow(long_field(fields, "placement")?, "placement")?,
            alias_pieces,
            pieces,
            source: SegmentSource::Avro,
        })
    }
}

fn read_node_aliases(
    source: &dyn AvroSource,
    cancel: &CancellationToken,
) -> LoopResult<NodeAliasMap> {
    let mut aliases = NodeAliasMap::new();
    for_each_record(source, cancel, |value| {
        let AvroValue::Record(fields) = value else {
            return Err(LoopError::malformed("node alias row is not an Avro record"));
        };
        let node = match bytes_field(&fields, "node_id")? {
            Some(bytes) => NodeId::from_bytes(bytes)?,
            None => return Err(LoopError::malformed("node_id is missing")),
        };
        let alias = narrow(long_field(&fields, "node_alias")?, "node_alias")?;
        aliases.insert(alias, node);
        Ok(())
    })?;
    Ok(aliases)
}

fn read_segment_records(
    source: &dyn AvroSource,
    cancel: &CancellationToken,
) -> LoopResult<Vec<RawRecord>> {
    let mut records = Vec::new();
    for_each_record(source, cancel, |value| {
        records.push(RawRecord::from_value(value)?);
        Ok(())
    })?;
    Ok(records)
}

fn for_each_record(
    source: &dyn AvroSource,
    cancel: &CancellationToken,
    mut handle: impl FnMut(AvroValue) -> LoopResult<()>,
) -> LoopResult<()> {
    for (file, reader) in source.open()?.into_iter().enumerate() {
        let reader = Reader::new(reader)
            .map_err(|e| LoopError::avro(&format!("failed to open file {}", file), e))?;
        for value in reader {
            if cancel.is_cancelled() {
                return Err(LoopError::Cancelled);
            }
            let value = value.map_err(|e| LoopError::avro("failed to read record", e))?;
            handle(value)?;
        }
    }
    Ok(())
}

/// Field value with any union wrapper removed; `None` when absent or null
fn field<'a>(fields: &'a [(String, AvroValue)], name: &str) -> Option<&'a AvroValue> {
    fields
        .iter()
        .find(|(field, _)| field == name)
        .map(|(_, value)| unwrap_union(value))
        .filter(|value| !matches!(value, AvroValue::Null))
}

fn unwrap_union(value: &AvroValue) -> &AvroValue {
    match value {
        AvroValue::Union(_, inner) => unwrap_union(inner),
        other => other,
    }
}

fn bytes_field<'a>(fields: &'a [(String, AvroValue)], name: &str) -> LoopResult<Option<&'a [u8]>> {
    match field(fields, name) {
        None => Ok(None),
        Some(AvroValue::Bytes(bytes)) | Some(AvroValue::Fixed(_, bytes)) => Ok(Some(bytes)),
        Some(other) => Err(type_mismatch(name, "bytes", other)),
    }
}

/// Missing and null longs read as zero
fn long_field(fields: &[(String, AvroValue)], name: &str) -> LoopResult<i64> {
    match field(fields, name) {
        None => Ok(0),
        Some(AvroValue::Long(value)) => Ok(*value),
        Some(AvroValue::Int(value)) => Ok(i64::from(*value)),
        Some(other) => Err(type_mismatch(name, "long", other)),
    }
}

fn time_field(fields: &[(String, AvroValue)], name: &str) -> LoopResult<Option<DateTime<Utc>>> {
    let parsed = match field(fields, name) {
        None => None,
        Some(AvroValue::String(text)) if text.is_empty() => None,
        Some(AvroValue::String(text)) => Some(
            DateTime::parse_from_rfc3339(text)
                .map(|time| time.with_timezone(&Utc))
                .map_err(|e| LoopError::malformed(format!("{}: {}", name, e)))?,
        ),
        Some(AvroValue::TimestampMicros(micros)) => Some(out_of_range(
            DateTime::from_timestamp_micros(*micros),
            name,
        )?),
        Some(AvroValue::TimestampMillis(millis)) => Some(out_of_range(
            DateTime::from_timestamp_millis(*millis),
            name,
        )?),
        Some(other) => return Err(type_mismatch(name, "timestamp", other)),
    };
    Ok(parsed)
}

fn out_of_range(time: Option<DateTime<Utc>>, name: &str) -> LoopResult<DateTime<Utc>> {
    time.ok_or_else(|| LoopError::malformed(format!("{} is out of range", name)))
}

fn narrow<T: TryFrom<i64>>(value: i64, name: &str) -> LoopResult<T> {
    T::try_from(value)
        .map_err(|_| LoopError::malformed(format!("{} value {} does not fit", name, value)))
}

fn type_mismatch(name: &str, expected: &str, found: &AvroValue) -> LoopError {
    LoopError::malformed(format!("{}: expected {}, found {:?}", name, expected, found))
}

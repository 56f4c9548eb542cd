use apache_avro::types::Value as AvroValue;
use apache_avro::{Schema as AvroSchema, Writer};

use crate::rangeloop::error::{LoopError, LoopResult};
use crate::rangeloop::provider::avro::{NODE_ALIAS_SCHEMA, SEGMENT_SCHEMA};
use crate::rangeloop::segment::{NodeId, Segment, encode_alias_pieces};

/// Write `records` into one object container file with the given schema
pub fn write_avro(schema_json: &str, records: Vec<AvroValue>) -> LoopResult<Vec<u8>> {
    let schema = AvroSchema::parse_str(schema_json)
        .map_err(|e| LoopError::avro("failed to parse schema", e))?;
    let mut writer = Writer::new(&schema, Vec::new());
    for record in records {
        writer
            .append(record)
            .map_err(|e| LoopError::avro("failed to append record", e))?;
    }
    writer
        .into_inner()
        .map_err(|e| LoopError::avro("failed to flush container", e))
}

fn nullable(value: Option<AvroValue>) -> AvroValue {
    match value {
        Some(value) => AvroValue::Union(1, Box::new(value)),
        None => AvroValue::Union(0, Box::new(AvroValue::Null)),
    }
}

/// Fields of one segment row in the order of the export schema.
///
/// Exposed so tests can tamper with single fields before writing.
pub fn segment_fields(segment: &Segment) -> Vec<(String, AvroValue)> {
    let alias_pieces = (!segment.alias_pieces.is_empty())
        .then(|| AvroValue::Bytes(encode_alias_pieces(&segment.alias_pieces)));

    vec![
        ("stream_id".into(), AvroValue::Bytes(segment.stream_id.as_bytes().to_vec())),
        ("position".into(), AvroValue::Long(segment.position.encode() as i64)),
        ("created_at".into(), AvroValue::String(segment.created_at.to_rfc3339())),
        (
            "expires_at".into(),
            nullable(segment.expires_at.map(|t| AvroValue::String(t.to_rfc3339()))),
        ),
        (
            "repaired_at".into(),
            nullable(segment.repaired_at.map(|t| AvroValue::String(t.to_rfc3339()))),
        ),
        ("root_piece_id".into(), AvroValue::Bytes(segment.root_piece_id.as_bytes().to_vec())),
        ("encrypted_size".into(), AvroValue::Long(i64::from(segment.encrypted_size))),
        ("plain_offset".into(), AvroValue::Long(segment.plain_offset)),
        ("plain_size".into(), AvroValue::Long(i64::from(segment.plain_size))),
        ("remote_alias_pieces".into(), nullable(alias_pieces)),
        ("redundancy".into(), AvroValue::Long(segment.redundancy.pack())),
        (
            "placement".into(),
            nullable(Some(AvroValue::Long(i64::from(segment.placement)))),
        ),
    ]
}

/// Segment export file holding `segments` in the given order
pub fn segments_avro(segments: &[Segment]) -> LoopResult<Vec<u8>> {
    write_avro(
        SEGMENT_SCHEMA,
        segments
            .iter()
            .map(|segment| AvroValue::Record(segment_fields(segment)))
            .collect(),
    )
}

/// Node alias export file
pub fn node_aliases_avro(aliases: &[(u32, NodeId)]) -> LoopResult<Vec<u8>> {
    write_avro(
        NODE_ALIAS_SCHEMA,
        aliases
            .iter()
            .map(|(alias, node)| {
                AvroValue::Record(vec![
                    ("node_id".into(), AvroValue::Bytes(node.as_bytes().to_vec())),
                    ("node_alias".into(), AvroValue::Long(i64::from(*alias))),
                ])
            })
            .collect(),
    )
}

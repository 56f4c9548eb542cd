//! End-to-end passes over Avro export files

use apache_avro::types::Value as AvroValue;
use rangeloop::rangeloop::provider::avro::SEGMENT_SCHEMA;
use rangeloop::rangeloop::provider::{AvroFileSource, AvroSegmentsSplitter, InMemoryAvroSource};
use rangeloop::rangeloop::segment::{NodeId, Piece, SegmentSource};
use rangeloop::testkit::{self, CallbackObserver};
use rangeloop::{LoopConfig, LoopError, Observer, RangeSplitter, Segment, Service};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn collector() -> (Arc<Mutex<Vec<Segment>>>, Arc<dyn Observer>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let seen = Arc::clone(&seen);
        CallbackObserver::new().on_process(move |batch| {
            seen.lock().unwrap().extend_from_slice(batch);
            Ok(())
        })
    };
    (seen, Arc::new(observer))
}

fn export_segments() -> Vec<Segment> {
    let mut segments = Vec::new();
    for stream in 1..=5u128 {
        for index in 0..3 {
            if stream % 2 == 0 {
                segments.push(testkit::remote_segment(
                    stream << 64,
                    index,
                    &[(0, 1), (1, 2), (2, 3)],
                ));
            } else {
                segments.push(testkit::segment(stream << 64, index));
            }
        }
    }
    segments
}

fn aliases() -> Vec<(u32, NodeId)> {
    (1..=3u32).map(|alias| (alias, testkit::node_id(alias as u8))).collect()
}

/// What a segment looks like after being read back from the export
fn as_exported(segment: &Segment) -> Segment {
    let mut expected = segment.clone();
    expected.source = SegmentSource::Avro;
    expected.pieces = segment
        .alias_pieces
        .iter()
        .map(|piece| Piece {
            number: piece.number,
            node: testkit::node_id(piece.alias as u8),
        })
        .collect();
    expected
}

fn sorted(mut segments: Vec<Segment>) -> Vec<Segment> {
    segments.sort_by_key(|s| (s.stream_id, s.position));
    segments
}

#[tokio::test]
async fn test_pass_over_export_files() {
    let dir = tempfile::tempdir().unwrap();
    let segments = export_segments();

    // split the export over two files, streams interleaved
    let (odd, even): (Vec<Segment>, Vec<Segment>) = segments
        .iter()
        .cloned()
        .partition(|s| s.position.index % 2 == 1);
    let files = [
        ("segments-000.avro", testkit::segments_avro(&odd).unwrap()),
        ("segments-001.avro", testkit::segments_avro(&even).unwrap()),
        ("aliases.avro", testkit::node_aliases_avro(&aliases()).unwrap()),
    ];
    for (name, bytes) in files {
        std::fs::write(dir.path().join(name), bytes).unwrap();
    }

    let splitter = AvroSegmentsSplitter::new(
        Arc::new(AvroFileSource::new(dir.path().join("segments-*.avro"))),
        Arc::new(AvroFileSource::new(dir.path().join("aliases.avro"))),
    );

    for parallelism in [1, 2, 3, 8] {
        for batch_size in [1, 2, 100] {
            let (seen, observer) = collector();
            let service = Service::new(
                LoopConfig::default()
                    .with_parallelism(parallelism)
                    .with_batch_size(batch_size),
                Arc::new(AvroSegmentsSplitter::new(
                    Arc::new(AvroFileSource::new(dir.path().join("segments-*.avro"))),
                    Arc::new(AvroFileSource::new(dir.path().join("aliases.avro"))),
                )),
                vec![observer],
            );
            let durations = service.run_once(&CancellationToken::new()).await.unwrap();
            assert!(!durations[0].is_failed());

            let seen = sorted(seen.lock().unwrap().clone());
            let expected = sorted(segments.iter().map(as_exported).collect());
            assert_eq!(seen, expected, "parallelism {} batch {}", parallelism, batch_size);
        }
    }

    // the splitter is reusable across passes
    let service = Service::new(LoopConfig::default(), Arc::new(splitter), Vec::new());
    service.run_once(&CancellationToken::new()).await.unwrap();
    service.run_once(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_in_memory_export() {
    let segments = export_segments();
    let (seen, observer) = collector();
    let service = Service::new(
        LoopConfig::default().with_parallelism(2),
        Arc::new(AvroSegmentsSplitter::new(
            Arc::new(InMemoryAvroSource::new(vec![testkit::segments_avro(&segments).unwrap()])),
            Arc::new(InMemoryAvroSource::new(vec![
                testkit::node_aliases_avro(&aliases()).unwrap(),
            ])),
        )),
        vec![observer],
    );

    service.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), segments.len());
}

async fn run_with_rows(
    rows: Vec<AvroValue>,
    aliases: Vec<(u32, NodeId)>,
) -> Result<usize, LoopError> {
    let (seen, observer) = collector();
    let service = Service::new(
        LoopConfig::default().with_parallelism(1),
        Arc::new(AvroSegmentsSplitter::new(
            Arc::new(InMemoryAvroSource::new(vec![
                testkit::write_avro(SEGMENT_SCHEMA, rows).unwrap(),
            ])),
            Arc::new(InMemoryAvroSource::new(vec![testkit::node_aliases_avro(&aliases).unwrap()])),
        )),
        vec![observer],
    );
    service.run_once(&CancellationToken::new()).await?;
    let count = seen.lock().unwrap().len();
    Ok(count)
}

fn row_with(segment: &Segment, name: &str, value: AvroValue) -> AvroValue {
    let mut fields = testkit::segment_fields(segment);
    for field in fields.iter_mut() {
        if field.0 == name {
            field.1 = value.clone();
        }
    }
    AvroValue::Record(fields)
}

#[tokio::test]
async fn test_truncated_alias_pieces_fail_the_partition() {
    let good = testkit::segment(1, 0);
    let bad = testkit::remote_segment(2, 0, &[(0, 1)]);
    let rows = vec![
        AvroValue::Record(testkit::segment_fields(&good)),
        row_with(
            &bad,
            "remote_alias_pieces",
            AvroValue::Union(1, Box::new(AvroValue::Bytes(vec![0; 5]))),
        ),
    ];

    let err = run_with_rows(rows, aliases()).await.unwrap_err();
    match err {
        LoopError::Partition { partition, source, .. } => {
            assert_eq!(partition, 0);
            assert!(matches!(*source, LoopError::MalformedRecord { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_unknown_node_alias_is_malformed() {
    let segment = testkit::remote_segment(2, 0, &[(0, 42)]);
    let rows = vec![AvroValue::Record(testkit::segment_fields(&segment))];

    let err = run_with_rows(rows, aliases()).await.unwrap_err();
    assert!(err.to_string().contains("malformed"));
}

#[tokio::test]
async fn test_bad_timestamp_is_malformed() {
    let segment = testkit::segment(3, 0);
    let rows = vec![row_with(&segment, "created_at", AvroValue::String("yesterday".into()))];

    let err = run_with_rows(rows, aliases()).await.unwrap_err();
    assert!(!err.is_cancelled());
    assert!(err.to_string().contains("created_at"));
}

#[tokio::test]
async fn test_export_without_files_passes() {
    let (seen, observer) = collector();
    let service = Service::new(
        LoopConfig::default().with_parallelism(3),
        Arc::new(AvroSegmentsSplitter::new(
            Arc::new(InMemoryAvroSource::new(Vec::new())),
            Arc::new(InMemoryAvroSource::new(Vec::new())),
        )),
        vec![observer],
    );

    let durations = service.run_once(&CancellationToken::new()).await.unwrap();
    assert!(!durations[0].is_failed());
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_iterate_partitions_of_export() {
    let segments = export_segments();
    let splitter = AvroSegmentsSplitter::new(
        Arc::new(InMemoryAvroSource::new(vec![testkit::segments_avro(&segments).unwrap()])),
        Arc::new(InMemoryAvroSource::new(vec![testkit::node_aliases_avro(&aliases()).unwrap()])),
    );
    let cancel = CancellationToken::new();

    let providers = splitter.create_ranges(&cancel, 3, 2).await.unwrap();
    assert_eq!(providers.len(), 3);

    let mut seen = Vec::new();
    for mut provider in providers {
        let range = provider.range();
        provider
            .iterate(&cancel, &mut |batch| {
                assert!(batch.len() <= 2);
                for segment in batch {
                    assert!(range.contains(&segment.stream_id));
                }
                seen.extend_from_slice(batch);
                Ok(())
            })
            .await
            .unwrap();
    }

    assert_eq!(sorted(seen), sorted(segments.iter().map(as_exported).collect()));
}

#[tokio::test]
async fn test_iterate_stops_at_first_callback_error() {
    let splitter = AvroSegmentsSplitter::new(
        Arc::new(InMemoryAvroSource::new(vec![
            testkit::segments_avro(&export_segments()).unwrap(),
        ])),
        Arc::new(InMemoryAvroSource::new(vec![testkit::node_aliases_avro(&aliases()).unwrap()])),
    );
    let cancel = CancellationToken::new();
    let mut providers = splitter.create_ranges(&cancel, 1, 4).await.unwrap();

    let mut calls = 0;
    let err = providers[0]
        .iterate(&cancel, &mut |_| {
            calls += 1;
            Err("enough".into())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, LoopError::Callback(_)));
    assert_eq!(calls, 1);
}

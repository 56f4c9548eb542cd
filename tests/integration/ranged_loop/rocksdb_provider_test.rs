//! Passes over a RocksDB segment store
#![cfg(feature = "rocksdb")]

use rangeloop::rangeloop::live_count::{LiveCountObserver, SegmentCounter};
use rangeloop::rangeloop::provider::{RocksRangeSplitter, RocksSegmentStore};
use rangeloop::rangeloop::segment::SegmentSource;
use rangeloop::testkit::{self, CallbackObserver};
use rangeloop::{
    LoopConfig, Observer, Segment, SegmentPosition, Service, compute_ranges,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn visitor() -> (Arc<Mutex<Vec<(Uuid, SegmentPosition)>>>, Arc<dyn Observer>) {
    let visited = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let visited = Arc::clone(&visited);
        CallbackObserver::new().on_process(move |batch| {
            // called concurrently from every partition
            let mut visited = visited.lock().unwrap();
            visited.extend(batch.iter().map(|s| (s.stream_id, s.position)));
            Ok(())
        })
    };
    (visited, Arc::new(observer))
}

#[tokio::test]
async fn test_loop_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksSegmentStore::open(dir.path()).unwrap();
    let parallelism = 4;

    let mut expected = Vec::new();
    for range in compute_ranges(parallelism as u32) {
        let Some(start) = range.start else {
            continue;
        };
        let mut next = *start.as_bytes();
        next[15] += 1;
        for stream_id in [start, Uuid::from_bytes(next)] {
            let segment = Segment {
                stream_id,
                ..testkit::segment(0, 0)
            };
            store.put_segments(&[segment]).unwrap();
            expected.push((stream_id, SegmentPosition::default()));
        }
    }

    for batch_size in [0, 1, 2, 3, 10] {
        let (visited, observer) = visitor();
        let service = Service::new(
            LoopConfig::default()
                .with_parallelism(parallelism)
                .with_batch_size(batch_size),
            Arc::new(RocksRangeSplitter::new(store.clone(), Duration::ZERO)),
            vec![observer],
        );
        service.run_once(&CancellationToken::new()).await.unwrap();

        let mut visited = visited.lock().unwrap().clone();
        visited.sort();
        assert_eq!(visited, expected, "batch size {}", batch_size);
    }
}

#[tokio::test]
async fn test_remote_segments_resolve_pieces() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksSegmentStore::open(dir.path()).unwrap();
    store
        .put_node_aliases((1..=3u32).map(|alias| (alias, testkit::node_id(alias as u8))))
        .unwrap();

    let segments: Vec<Segment> = (0..6u128)
        .flat_map(|stream| {
            (0..2).map(move |index| testkit::remote_segment(stream << 90, index, &[(0, 1), (5, 3)]))
        })
        .collect();
    store.put_segments(&segments).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = {
        let seen = Arc::clone(&seen);
        CallbackObserver::new().on_process(move |batch| {
            seen.lock().unwrap().extend_from_slice(batch);
            Ok(())
        })
    };
    let service = Service::new(
        LoopConfig::default().with_parallelism(3).with_batch_size(4),
        Arc::new(RocksRangeSplitter::new(store.clone(), Duration::from_secs(60))),
        vec![Arc::new(observer) as Arc<dyn Observer>],
    );
    service.run_once(&CancellationToken::new()).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), segments.len());
    for segment in seen.iter() {
        assert_eq!(segment.source, SegmentSource::RocksDb);
        assert_eq!(segment.pieces.len(), 2);
        assert_eq!(segment.pieces[0].node, testkit::node_id(1));
        assert_eq!(segment.pieces[1].number, 5);
        assert_eq!(segment.pieces[1].node, testkit::node_id(3));
    }
}

#[tokio::test]
async fn test_unknown_alias_aborts_pass() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksSegmentStore::open(dir.path()).unwrap();
    store
        .put_segments(&[testkit::remote_segment(7, 0, &[(0, 99)])])
        .unwrap();

    let service = Service::new(
        LoopConfig::default().with_parallelism(2),
        Arc::new(RocksRangeSplitter::new(store, Duration::ZERO)),
        Vec::new(),
    );
    let err = service.run_once(&CancellationToken::new()).await.unwrap_err();
    assert!(err.to_string().contains("partition 0"));
}

#[tokio::test]
async fn test_live_count_verifies_against_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksSegmentStore::open(dir.path()).unwrap();
    let segments: Vec<Segment> = (0..50u128).map(|i| testkit::segment(i << 70, 0)).collect();
    store.put_segments(&segments).unwrap();

    let live_count = Arc::new(LiveCountObserver::with_verification(Arc::new(store.clone()), 0.03));
    let service = Service::new(
        LoopConfig::default().with_parallelism(4).with_batch_size(8),
        Arc::new(RocksRangeSplitter::new(store.clone(), Duration::ZERO)),
        vec![live_count.clone() as Arc<dyn Observer>],
    );

    let durations = service.run_once(&CancellationToken::new()).await.unwrap();
    assert!(!durations[0].is_failed());
    assert_eq!(live_count.processed(), 50);
    assert_eq!(store.exact_segment_count().unwrap(), 50);
}

#[tokio::test]
async fn test_cancelled_pass_over_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksSegmentStore::open(dir.path()).unwrap();
    let segments: Vec<Segment> = (0..40u128).map(|i| testkit::segment(i << 80, 0)).collect();
    store.put_segments(&segments).unwrap();

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        CallbackObserver::new().on_process(move |_| {
            cancel.cancel();
            Ok(())
        })
    };
    let service = Service::new(
        LoopConfig::default().with_parallelism(2).with_batch_size(1),
        Arc::new(RocksRangeSplitter::new(store, Duration::from_secs(300))),
        vec![Arc::new(canceller) as Arc<dyn Observer>],
    );

    let err = service.run_once(&cancel).await.unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_live_count_survives_overwritten_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksSegmentStore::open(dir.path()).unwrap();
    let segments: Vec<Segment> = (0..300u128).map(|i| testkit::segment(i << 64, 0)).collect();
    store.put_segments(&segments).unwrap();
    store.put_segments(&segments).unwrap();
    store.delete_segment(&segments[0].stream_id, segments[0].position).unwrap();
    store.put_segments(&segments[..1]).unwrap();

    let cancel = CancellationToken::new();
    assert_eq!(store.count_segments(&cancel).await.unwrap(), 300);

    let live_count = Arc::new(LiveCountObserver::with_verification(Arc::new(store.clone()), 0.03));
    let service = Service::new(
        LoopConfig::default().with_parallelism(2).with_batch_size(50),
        Arc::new(RocksRangeSplitter::new(store, Duration::ZERO)),
        vec![live_count.clone() as Arc<dyn Observer>],
    );

    let durations = service.run_once(&cancel).await.unwrap();
    assert!(!durations[0].is_failed());
    assert_eq!(live_count.processed(), 300);
}

/// Counts every processed segment and, on the first batch, writes `late`
/// into the store
fn late_writer(store: RocksSegmentStore, late: Segment) -> (Arc<Mutex<usize>>, Arc<dyn Observer>) {
    let seen = Arc::new(Mutex::new(0));
    let written = AtomicBool::new(false);
    let observer = {
        let seen = Arc::clone(&seen);
        CallbackObserver::new().on_process(move |batch| {
            if !written.swap(true, Ordering::SeqCst) {
                store.put_segments(&[late.clone()])?;
            }
            *seen.lock().unwrap() += batch.len();
            Ok(())
        })
    };
    (seen, Arc::new(observer))
}

#[tokio::test]
async fn test_snapshot_age_controls_visibility_of_new_rows() {
    for (snapshot_max_age, expected) in [(Duration::from_secs(300), 3), (Duration::ZERO, 4)] {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksSegmentStore::open(dir.path()).unwrap();
        store
            .put_segments(&[
                testkit::segment(1, 0),
                testkit::segment(2, 0),
                testkit::segment(3, 0),
            ])
            .unwrap();

        // sorts after every existing row, so the cursor has not passed it yet
        let (seen, observer) = late_writer(store.clone(), testkit::segment(10, 0));
        let service = Service::new(
            LoopConfig::default().with_parallelism(1).with_batch_size(1),
            Arc::new(RocksRangeSplitter::new(store.clone(), snapshot_max_age)),
            vec![observer],
        );
        service.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), expected, "snapshot max age {:?}", snapshot_max_age);
        assert_eq!(store.exact_segment_count().unwrap(), 4);
    }
}

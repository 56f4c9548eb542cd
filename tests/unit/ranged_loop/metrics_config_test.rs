use rangeloop::rangeloop::metrics::PassMetricsRegistry;
use rangeloop::testkit::{self, CallbackObserver, CountObserver, MemorySplitter};
use rangeloop::{LoopConfig, Observer, Service};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_completed_pass_is_exported() {
    let metrics = Arc::new(PassMetricsRegistry::new().unwrap());
    let service = Service::new(
        LoopConfig::default().with_parallelism(2).with_batch_size(3),
        Arc::new(MemorySplitter::new(
            (0..10u128).map(|i| testkit::segment(i, 0)).collect(),
        )),
        vec![
            Arc::new(CountObserver::new()) as Arc<dyn Observer>,
            Arc::new(
                CallbackObserver::new()
                    .named("tally")
                    .on_join(|| Err("join failed".into())),
            ),
        ],
    )
    .with_metrics(Arc::clone(&metrics));

    let durations = service.run_once(&CancellationToken::new()).await.unwrap();

    let last = metrics.last_pass().unwrap();
    assert_eq!(last.observers, durations);
    assert_eq!(metrics.passes_total(), 1);
    assert_eq!(metrics.pass_failures_total(), 0);

    let text = metrics.gather_text().unwrap();
    assert!(text.contains(r#"rangeloop_observer_duration_seconds{observer="tally"} -1"#));
    assert!(text.contains(r#"rangeloop_observer_duration_seconds{observer="CountObserver"}"#));
    assert!(text.contains("rangeloop_pass_duration_seconds"));
}

#[tokio::test]
async fn test_observers_of_one_type_export_separately() {
    let metrics = Arc::new(PassMetricsRegistry::new().unwrap());
    let service = Service::new(
        LoopConfig::default(),
        Arc::new(MemorySplitter::new(vec![testkit::segment(1, 0)])),
        vec![
            Arc::new(CountObserver::new()) as Arc<dyn Observer>,
            Arc::new(CountObserver::new()),
        ],
    )
    .with_metrics(Arc::clone(&metrics));

    service.run_once(&CancellationToken::new()).await.unwrap();

    let text = metrics.gather_text().unwrap();
    assert!(text.contains(r#"observer="CountObserver#0""#));
    assert!(text.contains(r#"observer="CountObserver#1""#));
}

#[test]
fn test_config_file_then_environment() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "parallelism: 6\nbatch_size: 100\ninterval_secs: 60").unwrap();

    let config = LoopConfig::from_yaml_file(file.path())
        .unwrap()
        .merge_lookup(|key| (key == "RANGELOOP_BATCH_SIZE").then(|| "250".to_string()));

    assert_eq!(config.parallelism, 6);
    assert_eq!(config.batch_size, 250);
    assert_eq!(config.interval, Duration::from_secs(60));
    assert_eq!(config.snapshot_max_age, Duration::from_secs(300));
    assert!(config.summary().contains("parallelism=6"));
}

#[test]
fn test_missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(LoopConfig::from_yaml_file(dir.path().join("absent.yaml")).is_err());
}

use clap::{Parser, Subcommand};
use log::info;
use rangeloop::rangeloop::live_count::{LiveCountObserver, SegmentCounter};
use rangeloop::rangeloop::metrics::PassMetricsRegistry;
use rangeloop::rangeloop::provider::{AvroFileSource, AvroSegmentsSplitter};
use rangeloop::rangeloop::shutdown::cancel_on_signal;
use rangeloop::{LoopConfig, LoopError, LoopResult, Observer, RangeSplitter, Service};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rangeloop")]
#[command(about = "Ranged segment loop - scan segment metadata once per pass for many observers")]
#[command(version)]
struct Cli {
    /// YAML configuration file; RANGELOOP_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// RocksDB directory holding the segments and node_aliases column families
    #[arg(long, global = true, conflicts_with = "avro_segments")]
    rocksdb: Option<PathBuf>,

    /// Segment export files, a single `*` is allowed in the file name
    #[arg(long, global = true, requires = "avro_node_aliases")]
    avro_segments: Option<PathBuf>,

    /// Node alias export files, a single `*` is allowed in the file name
    #[arg(long, global = true, requires = "avro_segments")]
    avro_node_aliases: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single pass and print the observer durations
    Once {
        /// Also print the metrics in Prometheus text format
        #[arg(long)]
        metrics: bool,
    },
    /// Run passes every configured interval until SIGINT/SIGTERM
    Run,
}

struct Backend {
    splitter: Arc<dyn RangeSplitter>,
    counter: Option<Arc<dyn SegmentCounter>>,
}

fn load_config(cli: &Cli) -> LoopResult<LoopConfig> {
    let config = match &cli.config {
        Some(path) => LoopConfig::from_yaml_file(path)?,
        None => LoopConfig::default(),
    };
    let config = config.merge_lookup(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn open_backend(cli: &Cli, config: &LoopConfig) -> LoopResult<Backend> {
    if let Some(path) = &cli.rocksdb {
        return open_rocksdb(path, config);
    }
    if let (Some(segments), Some(node_aliases)) = (&cli.avro_segments, &cli.avro_node_aliases) {
        info!(
            "Reading Avro export {} with node aliases {}",
            segments.display(),
            node_aliases.display()
        );
        return Ok(Backend {
            splitter: Arc::new(AvroSegmentsSplitter::new(
                Arc::new(AvroFileSource::new(segments.clone())),
                Arc::new(AvroFileSource::new(node_aliases.clone())),
            )),
            counter: None,
        });
    }
    Err(LoopError::configuration(
        "no backend selected, pass --rocksdb or --avro-segments with --avro-node-aliases",
    ))
}

#[cfg(feature = "rocksdb")]
fn open_rocksdb(path: &std::path::Path, config: &LoopConfig) -> LoopResult<Backend> {
    use rangeloop::rangeloop::provider::{RocksRangeSplitter, RocksSegmentStore};

    info!("Opening RocksDB segment store at {}", path.display());
    let store = RocksSegmentStore::open(path)?;
    Ok(Backend {
        splitter: Arc::new(RocksRangeSplitter::new(store.clone(), config.snapshot_max_age)),
        counter: Some(Arc::new(store)),
    })
}

#[cfg(not(feature = "rocksdb"))]
fn open_rocksdb(path: &std::path::Path, _config: &LoopConfig) -> LoopResult<Backend> {
    Err(LoopError::configuration(format!(
        "cannot open {}: built without the rocksdb feature",
        path.display()
    )))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    info!("Ranged loop configuration: {}", config.summary());

    let backend = open_backend(&cli, &config)?;
    let live_count = Arc::new(match backend.counter {
        Some(counter) => {
            LiveCountObserver::with_verification(counter, config.suspicious_processed_ratio)
        }
        None => LiveCountObserver::new(),
    });
    let metrics = Arc::new(PassMetricsRegistry::new()?);
    let service = Service::new(
        config,
        backend.splitter,
        vec![live_count.clone() as Arc<dyn Observer>],
    )
    .with_metrics(Arc::clone(&metrics));

    let cancel = CancellationToken::new();
    let signals = cancel_on_signal(cancel.clone());

    match cli.command {
        Commands::Once { metrics: print_metrics } => {
            let durations = service.run_once(&cancel).await?;
            println!("Processed {} segments", live_count.processed());
            for duration in &durations {
                println!("  {}", duration);
            }
            if print_metrics {
                print!("{}", metrics.gather_text()?);
            }
        }
        Commands::Run => {
            service.run(&cancel).await?;
            info!("Ranged loop driver exited");
        }
    }

    signals.abort();
    Ok(())
}

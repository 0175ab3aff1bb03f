//! CLI for the rollup APM pre-aggregation engine.
//!
//! Provides commands for inspecting buffer stores, ingesting and harvesting
//! events, running the full service, and benchmarking the write path.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use rollup::aggregator::Aggregator;
use rollup::clock::{Clock, ManualClock, SystemClock};
use rollup::config::{AggregatorConfig, HistogramConfig, SketchConfig};
use rollup::event::{ApmEvent, Outcome};
use rollup::harvest::Harvester;
use rollup::service::AggregationService;
use rollup::sink::{JsonLinesSink, Sink};
use rollup::store::BufferStore;
use rollup::telemetry::{AggregatorMetrics, HarvestMetrics};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// rollup: durable pre-aggregation of APM events.
#[derive(Parser)]
#[command(name = "rollup", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Display store metadata, buffered windows, and storage statistics.
    Info {
        /// Path to the store directory.
        store_path: PathBuf,
    },

    /// Merge JSON-lines events into a store.
    Ingest {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Events file, one JSON object per line ("-" for stdin).
        #[arg(default_value = "-")]
        input: PathBuf,

        /// Aggregator configuration (JSON).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Events per durable batch.
        #[arg(long, default_value = "1000")]
        batch: usize,

        /// Treat each batch's newest timestamp as "now" (for recorded data).
        #[arg(long)]
        replay: bool,
    },

    /// Publish buffered windows as JSON lines.
    Harvest {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Aggregator configuration (JSON).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Harvest every buffered window, including open ones.
        #[arg(long)]
        force: bool,

        /// Output file (defaults to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run the service: ingest stdin until EOF or Ctrl-C, harvesting continuously.
    Run {
        /// Path to the store directory.
        store_path: PathBuf,

        /// Aggregator configuration (JSON).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Output file for records (defaults to stdout).
        #[arg(long)]
        output: Option<PathBuf>,

        /// Events per durable batch.
        #[arg(long, default_value = "1000")]
        batch: usize,

        /// Print Prometheus metrics to stderr on exit.
        #[arg(long)]
        metrics: bool,
    },

    /// Run a write-path microbenchmark.
    Bench {
        /// Number of events to aggregate.
        #[arg(long, default_value = "100000")]
        events: u64,

        /// Number of distinct services.
        #[arg(long, default_value = "20")]
        services: u32,

        /// Number of distinct transaction names per service.
        #[arg(long, default_value = "50")]
        names: u32,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { store_path } => cmd_info(&store_path),
        Commands::Ingest {
            store_path,
            input,
            config,
            batch,
            replay,
        } => cmd_ingest(&store_path, &input, config.as_deref(), batch, replay),
        Commands::Harvest {
            store_path,
            config,
            force,
            output,
        } => cmd_harvest(&store_path, config.as_deref(), force, output.as_deref()),
        Commands::Run {
            store_path,
            config,
            output,
            batch,
            metrics,
        } => cmd_run(&store_path, config.as_deref(), output.as_deref(), batch, metrics),
        Commands::Bench {
            events,
            services,
            names,
        } => cmd_bench(events, services, names),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `rollup info <store_path>`.
fn cmd_info(store_path: &Path) -> CliResult {
    let meta = read_meta(store_path)?
        .ok_or_else(|| format!("No store found at '{}'", store_path.display()))?;
    let config = load_config(store_path, None)?;

    println!("Store: {}", store_path.display());
    if let Some(version) = meta.get("version").and_then(serde_json::Value::as_u64) {
        println!("  Format version: {version}");
    }
    if let Some(hash) = meta.get("value_format_hash").and_then(serde_json::Value::as_u64) {
        println!("  Value format hash: {hash:016x}");
    }
    println!(
        "  Histogram: {} significant bits, max {} us",
        config.histogram.significant_bits, config.histogram.max_value_us
    );
    println!("  Sketch precision: {}", config.sketch.precision);
    println!();

    let store = BufferStore::open(store_path, &config)?;
    println!("Buffered entries: {}", store.len());
    for interval in &config.intervals {
        let windows = store.windows(interval.interval_ms())?;
        println!(
            "  Interval {}: {} window(s)",
            format_duration(interval.interval),
            windows.len()
        );
        for window_start in windows {
            let entries = store.scan_window(interval.interval_ms(), window_start).count();
            println!("    {window_start}: {entries} entries");
        }
    }
    println!();

    let stats = store.stats();
    println!(
        "Disk usage: {} ({} bytes)",
        format_bytes(stats.disk_usage_bytes),
        stats.disk_usage_bytes
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}

/// Implements `rollup ingest <store_path> [input]`.
fn cmd_ingest(
    store_path: &Path,
    input: &Path,
    config_path: Option<&Path>,
    batch: usize,
    replay: bool,
) -> CliResult {
    let config = load_config(store_path, config_path)?;
    let store = Arc::new(BufferStore::open(store_path, &config)?);
    let manual = Arc::new(ManualClock::new(0));
    let clock: Arc<dyn Clock> = if replay {
        manual.clone()
    } else {
        Arc::new(SystemClock)
    };
    let aggregator = Aggregator::new(config, store, clock, AggregatorMetrics::new()?)?;
    let cancel = CancellationToken::new();

    let reader = open_input(input)?;
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut events = Vec::with_capacity(batch);
    let mut lines = reader.lines();

    loop {
        events.clear();
        let mut read = 0usize;
        for line in lines.by_ref().take(batch.max(1)) {
            let line = line?;
            read += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ApmEvent>(&line) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(error = %e, "skipping malformed event");
                    rejected += 1;
                }
            }
        }
        if read == 0 {
            break;
        }
        if let Some(newest) = events.iter().map(|e| e.timestamp_ns).max() {
            if newest > manual.now_ns() {
                manual.set(newest);
            }
        }

        let report = aggregator.add_batch(&events, &cancel)?;
        accepted += report.accepted;
        rejected += report.rejected.len();
        for (index, error) in report.rejected.iter().take(3) {
            warn!(index, error = %error, "event rejected");
        }
    }

    info!(accepted, rejected, "ingest complete");
    println!("Accepted: {accepted}");
    println!("Rejected: {rejected}");
    Ok(())
}

/// Implements `rollup harvest <store_path>`.
fn cmd_harvest(
    store_path: &Path,
    config_path: Option<&Path>,
    force: bool,
    output: Option<&Path>,
) -> CliResult {
    let config = load_config(store_path, config_path)?;
    let store = Arc::new(BufferStore::open(store_path, &config)?);
    let aggregator = Aggregator::new(config, store, Arc::new(SystemClock), AggregatorMetrics::new()?)?;
    let harvester = Harvester::new(&aggregator, open_output(output)?, HarvestMetrics::new()?);

    let cancel = CancellationToken::new();
    let reports = if force {
        harvester.harvest_all(&cancel)?
    } else {
        harvester.harvest_ready(&cancel)?
    };

    let records: usize = reports.iter().map(|r| r.records).sum();
    let corrupt: usize = reports.iter().map(|r| r.corrupt).sum();
    info!(windows = reports.len(), records, corrupt, "harvest complete");
    Ok(())
}

/// Implements `rollup run <store_path>`.
fn cmd_run(
    store_path: &Path,
    config_path: Option<&Path>,
    output: Option<&Path>,
    batch: usize,
    print_metrics: bool,
) -> CliResult {
    let config = load_config(store_path, config_path)?;
    let sink = open_output(output)?;
    let registry = Registry::new();

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(async {
        let service = AggregationService::start(store_path, config, sink, &registry).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<Vec<ApmEvent>>(4);
        let reader = tokio::task::spawn_blocking(move || read_batches(batch, &tx));

        let pumped = pump_batches(&service, rx).await;
        reader.abort();

        // Shut down even after a failed batch so the final harvest and sync run
        let shutdown = service.shutdown().await;
        if let Err(e) = pumped {
            if let Err(shutdown_error) = shutdown {
                warn!(error = %shutdown_error, "shutdown after failed batch also failed");
            }
            return Err(e.into());
        }
        shutdown?;
        CliResult::Ok(())
    });
    // The stdin reader may still be blocked in a read
    runtime.shutdown_timeout(Duration::from_millis(100));
    outcome?;

    if print_metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        std::io::stderr().write_all(&buffer)?;
    }
    Ok(())
}

/// Feeds batches to the service until the channel closes, Ctrl-C, or the
/// first failed batch.
async fn pump_batches(
    service: &AggregationService,
    mut rx: tokio::sync::mpsc::Receiver<Vec<ApmEvent>>,
) -> rollup::Result<()> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
            next = rx.recv() => {
                let Some(events) = next else { return Ok(()) };
                let report = service.add_batch(events).await?;
                if !report.rejected.is_empty() {
                    warn!(rejected = report.rejected.len(), "events rejected");
                }
            }
        }
    }
}

/// Reads stdin in batches and forwards them until EOF or the receiver closes.
fn read_batches(batch: usize, tx: &tokio::sync::mpsc::Sender<Vec<ApmEvent>>) {
    let stdin = std::io::stdin();
    let mut events = Vec::with_capacity(batch);
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        match serde_json::from_str::<ApmEvent>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(error = %e, "skipping malformed event"),
        }
        if events.len() >= batch.max(1) && tx.blocking_send(std::mem::take(&mut events)).is_err() {
            return;
        }
    }
    if !events.is_empty() {
        let _ = tx.blocking_send(events);
    }
}

/// Implements `rollup bench`.
#[allow(clippy::cast_precision_loss)] // Benchmark stats are fine with f64 precision
fn cmd_bench(events: u64, services: u32, names: u32) -> CliResult {
    println!("rollup write-path benchmark");
    println!("  Events: {events}");
    println!("  Services: {services}");
    println!("  Names per service: {names}");
    println!();

    let temp_dir = std::env::temp_dir().join("rollup_bench");
    let _ = std::fs::remove_dir_all(&temp_dir);

    let base_time = 1_700_000_040_000_000_000u64;
    let config = AggregatorConfig::default();
    let store = Arc::new(BufferStore::open(&temp_dir, &config)?);
    let clock = Arc::new(ManualClock::new(base_time));
    let aggregator = Aggregator::new(config, store, clock, AggregatorMetrics::new()?)?;

    let services = services.max(1);
    let names = names.max(1);
    let generated: Vec<ApmEvent> = (0..events)
        .map(|i| {
            #[allow(clippy::cast_possible_truncation)] // modulo keeps values in u32 range
            let service = (i % u64::from(services)) as u32;
            #[allow(clippy::cast_possible_truncation)]
            let name = ((i / u64::from(services)) % u64::from(names)) as u32;
            ApmEvent::transaction(
                base_time + (i % 50) * 1_000_000_000,
                format!("service-{service}"),
                "request",
                format!("GET /route/{name}"),
                100 + (i * 37) % 50_000,
                if i % 20 == 0 {
                    Outcome::Failure
                } else {
                    Outcome::Success
                },
            )
        })
        .collect();

    println!("Aggregating {events} events in batches of 1000...");
    let cancel = CancellationToken::new();
    let start = Instant::now();
    let mut accepted = 0usize;
    for chunk in generated.chunks(1000) {
        accepted += aggregator.add_batch(chunk, &cancel)?.accepted;
    }
    let elapsed = start.elapsed();

    let harvester = Harvester::new(
        &aggregator,
        Box::new(JsonLinesSink::new(std::io::sink())),
        HarvestMetrics::new()?,
    );
    let harvest_start = Instant::now();
    let reports = harvester.harvest_all(&cancel)?;
    let harvest_elapsed = harvest_start.elapsed();
    let records: usize = reports.iter().map(|r| r.records).sum();

    let ns_per_event = elapsed.as_nanos() as f64 / accepted.max(1) as f64;
    let events_per_sec = accepted as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results:");
    println!("  Accepted: {accepted}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_event:.1} ns/event");
    println!("  Throughput: {events_per_sec:.0} events/sec");
    println!("  Harvested: {records} records in {harvest_elapsed:.3?}");
    println!();

    drop(harvester);
    drop(aggregator);
    let _ = std::fs::remove_dir_all(&temp_dir);

    Ok(())
}

/// Loads the configuration, falling back to the value format recorded in
/// an existing store when no file is given.
fn load_config(store_path: &Path, config_path: Option<&Path>) -> CliResult<AggregatorConfig> {
    if let Some(path) = config_path {
        return Ok(AggregatorConfig::from_json_file(path)?);
    }

    let mut config = AggregatorConfig::default();
    if let Some(meta) = read_meta(store_path)? {
        if let Some(histogram) = meta.get("histogram") {
            config.histogram = serde_json::from_value::<HistogramConfig>(histogram.clone())?;
        }
        if let Some(sketch) = meta.get("sketch") {
            config.sketch = serde_json::from_value::<SketchConfig>(sketch.clone())?;
        }
    }
    Ok(config)
}

fn read_meta(store_path: &Path) -> CliResult<Option<serde_json::Value>> {
    let meta_path = store_path.join("meta.json");
    if !meta_path.exists() {
        return Ok(None);
    }
    let meta_data = std::fs::read_to_string(&meta_path)?;
    Ok(Some(serde_json::from_str(&meta_data)?))
}

fn open_input(input: &Path) -> CliResult<Box<dyn BufRead>> {
    if input == Path::new("-") {
        Ok(Box::new(BufReader::new(std::io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(std::fs::File::open(input)?)))
    }
}

fn open_output(output: Option<&Path>) -> CliResult<Box<dyn Sink>> {
    let writer: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => Box::new(std::io::stdout()),
    };
    Ok(Box::new(JsonLinesSink::new(writer)))
}

/// Formats a duration as a compact human-readable string.
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else if secs > 0 {
        format!("{secs}s")
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Formats a byte count as a human-readable string.
#[allow(clippy::cast_precision_loss)] // Byte counts are display-only
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} B")
    }
}

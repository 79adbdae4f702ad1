//! Connection Tracker - Consumer Daemon
//!
//! Builds the tracker tables, drains closed connections from the per-CPU
//! rings, polls port bindings, and exports a report.
//!
//! ## Usage
//!
//! ```bash
//! # Replay a hook trace and export to JSON
//! ./conntrackd --trace hooks.jsonl --output report.json
//!
//! # Small tables, eager close batches, verbose logging
//! ./conntrackd --trace hooks.jsonl --max-connections 1024 --batch-size 1 -v
//!
//! # Export to Prometheus format
//! ./conntrackd --trace hooks.jsonl --format prometheus --output report.prom
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use conntrack_daemon::{
    collector::MetricsCollector,
    events::EventProcessor,
    exporter::{ExporterType, JsonExporter, MetricsExporter, PrometheusExporter},
    replay::replay_file,
    types::TrackerMetrics,
};
use conntrack_tracer::{Tracer, TracerConfig};
use log::info;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal,
    sync::Mutex,
    time::{sleep, Instant},
};

/// Connection tracker consumer
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Capacity of the statistics and port binding tables
    #[clap(long, default_value_t = conntrack_common::DEFAULT_MAX_TRACKED_CONNECTIONS)]
    max_connections: u32,

    /// Closed connections per batch before an eager flush
    #[clap(long, default_value_t = conntrack_common::DEFAULT_CLOSE_BATCH_SIZE)]
    batch_size: usize,

    /// Number of CPUs (defaults to the available parallelism)
    #[clap(long)]
    cpus: Option<u32>,

    /// Undelivered batches buffered per CPU
    #[clap(long, default_value_t = conntrack_common::DEFAULT_CLOSE_CHANNEL_DEPTH)]
    channel_depth: usize,

    /// Timer flush interval for partially filled batches (milliseconds)
    #[clap(long, default_value_t = 100)]
    flush_interval_ms: u64,

    /// Port binding poll interval in seconds
    #[clap(long, default_value_t = 5)]
    poll_interval: u64,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    /// Duration to run without a trace (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 60)]
    duration: u64,

    /// JSON-lines hook trace to replay; the daemon exits once it is consumed
    #[clap(short, long)]
    trace: Option<PathBuf>,

    /// Output file for the report
    #[clap(short, long, default_value = "conntrack-report.json")]
    output: PathBuf,

    /// Output format (json, prometheus)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn tracer_config(&self) -> TracerConfig {
        let defaults = TracerConfig::default();
        TracerConfig {
            max_tracked_connections: self.max_connections,
            close_batch_size: self.batch_size,
            close_channel_depth: self.channel_depth,
            num_cpus: self.cpus.unwrap_or(defaults.num_cpus),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    if args.flush_interval_ms == 0 || args.poll_interval == 0 || args.progress_interval == 0 {
        anyhow::bail!("Flush, poll and progress intervals must be >= 1");
    }

    let export_format = ExporterType::parse(&args.format).ok_or_else(|| {
        anyhow::anyhow!("Unsupported format: {}. Use json or prometheus", args.format)
    })?;

    let config = args.tracer_config();
    info!("Starting connection tracker...");
    info!("   Max connections: {}", config.max_tracked_connections);
    info!("   CPUs: {}", config.num_cpus);
    info!(
        "   Close batches: {} records, {} per ring, flushed every {} ms",
        config.close_batch_size, config.close_channel_depth, args.flush_interval_ms
    );
    info!("   Output: {:?}", args.output);
    info!("   Format: {}", args.format);

    let (tracer, readers) = Tracer::new(config).context("Invalid tracer configuration")?;
    let tracer = Arc::new(tracer);

    // Create metrics collector and the consumer tasks
    let collector = Arc::new(Mutex::new(MetricsCollector::new()));
    let mut processor = EventProcessor::new(Arc::clone(&tracer), Arc::clone(&collector), args.verbose);
    processor.spawn_cpu_readers(readers);
    processor.spawn_flush_timer(args.flush_interval_ms);
    processor.spawn_port_poller(args.poll_interval);
    processor.spawn_progress_reporter(args.progress_interval);

    let start_time = Instant::now();

    if let Some(path) = args.trace.clone() {
        let replay_tracer = Arc::clone(&tracer);
        let stats = tokio::task::spawn_blocking(move || replay_file(&replay_tracer, &path))
            .await
            .context("Replay task failed")??;
        info!(
            "Replay complete: {} hook invocations dispatched, {} malformed lines skipped",
            stats.dispatched, stats.malformed
        );
    } else if args.duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }

    let elapsed = start_time.elapsed().as_secs();

    // Push out partial batches, then let the readers drain their rings
    tracer.flush_close_batches();
    processor.shutdown().await;

    info!("Generating report...");

    let mut collector = collector.lock().await;
    collector.poll_ports(&tracer);
    let metrics = collector.generate_metrics(&tracer, elapsed);

    match export_format {
        ExporterType::Json => {
            let exporter = JsonExporter::new(args.output.clone(), true);
            exporter.export(&metrics)?;
        }
        ExporterType::Prometheus => {
            let exporter = PrometheusExporter::new(args.output.clone());
            exporter.export(&metrics)?;
        }
    }

    info!("Report written to {:?}", args.output);

    print_summary(&metrics);

    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║            Connection Tracker Daemon              ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(metrics: &TrackerMetrics) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Closed connections: {}", metrics.closed_connections.len());
    info!("  Active connections: {}", metrics.active_connections);
    info!("  Port bindings:      {}", metrics.port_bindings.len());
    info!("  Ports released:     {}", metrics.ports_released);
    info!("  Duration:           {} seconds", metrics.duration_seconds);
    info!("");
    info!("  Traffic (closed connections):");
    info!("    sent bytes:   {:>12}", metrics.totals.sent_bytes);
    info!("    recv bytes:   {:>12}", metrics.totals.recv_bytes);
    info!("    sent packets: {:>12}", metrics.totals.sent_packets);
    info!("    recv packets: {:>12}", metrics.totals.recv_packets);
    info!("    retransmits:  {:>12}", metrics.totals.retransmits);
    info!("");
    info!("  Close batches per CPU:");
    for (cpu, count) in &metrics.flushes_by_cpu {
        info!("    cpu {:<3} {:>8}", cpu, count);
    }
    info!("");
    info!("  Telemetry:");
    for (name, value) in &metrics.telemetry {
        info!("    {:<24} {:>8}", name, value);
    }
    info!("");
    info!("============================================");
}

//! Sensor-Sync - snapshot synchronization and calibration pipeline
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline against simulated devices
//! sensor-sync run --simulate
//!
//! # Also broadcast calibrated snapshots as JSON datagrams
//! sensor-sync run --simulate --broadcast 255.255.255.255:9750
//!
//! # Fit raw,standard points and commit them to DAQ channel 2
//! sensor-sync fit --points points.csv --source DAQ --channel 2
//! ```
//!
//! # Environment Variables
//!
//! - `SENSOR_SYNC_CONFIG`: Path to the pipeline TOML (default: ./sensor_sync.toml)
//! - `RUST_LOG`: Logging level (default: info)

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sensor_sync::acquisition::{simulated, spawn_adapter};
use sensor_sync::calibration::{fit_with_summary, spawn_calibration_watcher};
use sensor_sync::distribution::{run_broadcaster, run_snapshot_log, UdpBroadcaster};
use sensor_sync::{
    Aggregator, CalibrationPoint, CalibrationStore, PipelineConfig, SnapshotHub, SourceKind,
    SourceRegistry,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "sensor-sync")]
#[command(about = "Multi-source sensor snapshot synchronization and calibration")]
#[command(version)]
struct CliArgs {
    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Subcommand, Debug)]
enum SubCommand {
    /// Run the acquisition → aggregation → distribution pipeline
    Run {
        /// Pipeline configuration file (overrides SENSOR_SYNC_CONFIG)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Drive every configured source from a simulated device
        #[arg(long)]
        simulate: bool,

        /// Seed for the simulated devices (reproducible runs)
        #[arg(long, requires = "simulate")]
        seed: Option<u64>,

        /// Broadcast calibrated snapshots as JSON datagrams to this address
        #[arg(long, value_name = "HOST:PORT")]
        broadcast: Option<SocketAddr>,
    },

    /// Fit a calibration polynomial to `raw,standard` points
    Fit {
        /// CSV file with one `raw,standard` pair per line
        #[arg(long, value_name = "FILE")]
        points: PathBuf,

        /// Source section to commit to (Modbus, DAQ, Serial)
        #[arg(long, requires = "channel")]
        source: Option<String>,

        /// Channel index to commit to
        #[arg(long, requires = "source")]
        channel: Option<usize>,

        /// Calibration file to commit into
        #[arg(long, value_name = "FILE", env = "SENSOR_SYNC_CALIBRATION")]
        calibration: Option<PathBuf>,
    },
}

// ============================================================================
// Supervisor
// ============================================================================

type TaskName = &'static str;

/// Monitor background tasks until shutdown; a failed task cancels the rest.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("Supervisor: all tasks spawned, monitoring");

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next(), if !task_set.is_empty() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = task_name, "Supervisor: task completed");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "Supervisor: task failed");
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Supervisor: task panicked");
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {e}"));
                    }
                    None => {}
                }
            }
        }
    }

    Ok(())
}

// ============================================================================
// Run
// ============================================================================

async fn run_pipeline(
    config: PipelineConfig,
    simulate: bool,
    seed: Option<u64>,
    broadcast: Option<SocketAddr>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let registry = Arc::new(SourceRegistry::from_config(&config));
    let store = Arc::new(CalibrationStore::open(&config.calibration.path));
    let hub = SnapshotHub::new(
        config.aggregator.broadcast_capacity,
        config.aggregator.history_capacity,
    );
    let aggregator = Aggregator::new(&config, Arc::clone(&registry), Arc::clone(&store), hub.clone());

    // Ingestion adapters
    let mut adapter_threads = Vec::new();
    if simulate {
        for adapter in simulated::simulated_adapters(&config, seed)? {
            adapter_threads.push(spawn_adapter(adapter, &registry, cancel_token.clone())?);
        }
    } else {
        warn!("No device adapters attached, every source will report invalid");
    }

    // Consumers
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    if config.log.enabled {
        let rx = hub.subscribe();
        let path = config.log.path.clone();
        let log_config = config.clone();
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            run_snapshot_log(path, log_config, rx, cancel).await?;
            Ok("snapshot-log")
        });
    }

    if let Some(target) = broadcast {
        let broadcaster = UdpBroadcaster::bind(target)
            .await
            .with_context(|| format!("Failed to bind broadcaster for {target}"))?;
        let rx = hub.subscribe();
        let cancel = cancel_token.clone();
        task_set.spawn(async move {
            run_broadcaster(broadcaster, rx, cancel).await;
            Ok("udp-broadcast")
        });
    }

    if let Some(watcher) =
        spawn_calibration_watcher(&config.calibration, Arc::clone(&store), cancel_token.clone())
    {
        task_set.spawn(async move {
            watcher.await?;
            Ok("calibration-watcher")
        });
    }

    aggregator.enable()?;
    info!(
        sources = registry.kinds().count(),
        computed = config.computed.len(),
        calibration_entries = store.table().len(),
        "Pipeline running"
    );

    let result = run_supervisor(&mut task_set, cancel_token.clone()).await;

    // Shutdown: stop ticking first so the last snapshot stays the latest.
    cancel_token.cancel();
    aggregator.disable().await;
    if let Some(last) = aggregator.latest() {
        info!(seq = last.sequence_index, t = last.timestamp, "Last snapshot");
    }

    for handle in adapter_threads {
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "Adapter ended with error"),
            Ok(Err(_)) | Err(_) => error!("Adapter thread panicked"),
        }
    }

    while let Some(joined) = task_set.join_next().await {
        if let Ok(Err(e)) = joined {
            warn!(error = %e, "Task failed during shutdown");
        }
    }

    result
}

// ============================================================================
// Fit
// ============================================================================

/// Parse `raw,standard` lines; blank lines, `#` comments and a non-numeric
/// header line are skipped.
fn parse_points(contents: &str) -> Result<Vec<CalibrationPoint>> {
    let mut points = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let [raw, standard] = fields.as_slice() else {
            bail!("line {}: expected `raw,standard`, got {:?}", idx + 1, line);
        };
        match (raw.parse::<f64>(), standard.parse::<f64>()) {
            (Ok(r), Ok(s)) => points.push(CalibrationPoint::new(r, s)),
            _ if idx == 0 && points.is_empty() => {}
            _ => bail!("line {}: non-numeric value in {:?}", idx + 1, line),
        }
    }
    Ok(points)
}

fn run_fit(
    points_path: &Path,
    target: Option<(String, usize)>,
    calibration: Option<PathBuf>,
) -> Result<()> {
    let contents = std::fs::read_to_string(points_path)
        .with_context(|| format!("Failed to read {}", points_path.display()))?;
    let points = parse_points(&contents)?;
    let summary = fit_with_summary(&points)?;

    let p = summary.params;
    println!("points:   {}", points.len());
    println!("degree:   {}", summary.degree);
    println!("singular: {}", summary.singular);
    println!("coeffs:   a={:?} b={:?} c={:?} d={:?}", p.a, p.b, p.c, p.d);
    println!("rms:      {:.6}", summary.rms_residual);

    let Some((source, channel)) = target else {
        return Ok(());
    };
    let Some(kind) = SourceKind::from_section_name(&source) else {
        bail!("Unknown source {source:?} (expected Modbus, DAQ or Serial)");
    };
    let path = calibration.unwrap_or_else(|| PipelineConfig::load().calibration.path);

    let store = CalibrationStore::open(&path);
    let params = BTreeMap::from([(channel, p)]);
    let entries = store
        .commit(&path, kind.section_name(), &params)
        .with_context(|| format!("Failed to commit calibration to {}", path.display()))?;
    println!(
        "committed {}:Channel_{channel} to {} ({entries} entries)",
        kind.section_name(),
        path.display()
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    match args.command {
        SubCommand::Fit {
            points,
            source,
            channel,
            calibration,
        } => run_fit(&points, source.zip(channel), calibration),

        SubCommand::Run {
            config,
            simulate,
            seed,
            broadcast,
        } => {
            let config = match config {
                Some(path) => PipelineConfig::load_from_file(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => PipelineConfig::load(),
            };

            info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            info!("  Sensor-Sync - snapshot synchronization pipeline");
            info!(
                "  Tick: {} ms | History: {} | Filter: {}",
                config.aggregator.tick_interval_ms,
                config.aggregator.history_capacity,
                if config.filter.enabled { "on" } else { "off" }
            );
            info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

            // Graceful shutdown via Ctrl+C
            let cancel_token = CancellationToken::new();
            let shutdown_token = cancel_token.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Received Ctrl+C, initiating shutdown");
                shutdown_token.cancel();
            });

            run_pipeline(config, simulate, seed, broadcast, cancel_token).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_points_skips_header_and_comments() {
        let points = parse_points("raw,standard\n# zero\n0.0, 1.0\n\n2.0,5.0\n").unwrap();
        assert_eq!(points, vec![CalibrationPoint::new(0.0, 1.0), CalibrationPoint::new(2.0, 5.0)]);
    }

    #[test]
    fn test_parse_points_rejects_bad_lines() {
        assert!(parse_points("1.0,2.0\n3.0\n").is_err());
        assert!(parse_points("1.0,2.0\nx,4.0\n").is_err());
    }
}

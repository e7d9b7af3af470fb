use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::block_in_place;
use tracing::{error, info, warn};

use sink_core::checkpoint::{load_checkpoint, save_checkpoint};
use sink_core::config::load_config;
use sink_core::telemetry::init_tracing;
use sink_core::{Ingestor, KeyedRecord};

/// This is the entry point for running the sink as a long-running process on
/// container hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config (path as first argument, or YAML in `SINK_CONFIG`).
///     Resume partitions from the last checkpoint, if any.
///     Main loop runs until stdin closes or a shutdown signal is received:
///         - read `{"key": ..., "value": {...}}` lines from stdin
///         - route and collect them, writing full groups to DuckDB
///         - every flush timeout, hand timed-out groups over and save a checkpoint
///     Close every partition, flushing what is buffered.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())?;
    let checkpoint_path = config.checkpoint_path.as_ref().map(PathBuf::from);

    let checkpoint = match &checkpoint_path {
        Some(path) => load_checkpoint(path).context("Failed to load checkpoint")?,
        None => None,
    };
    let mut ingestor =
        Ingestor::new(config.clone(), checkpoint.as_ref()).context("Failed to start sink")?;

    let outcome = run(&mut ingestor, config.flush_timeout(), checkpoint_path.as_deref()).await;
    if let Err(e) = &outcome {
        error!("Ingestion stopped: {:?}", e);
    }

    // Runs on every exit path so buffered rows get a final flush attempt.
    let shutdown = block_in_place(|| ingestor.shutdown());
    match &shutdown {
        Ok(metrics) => info!("Final metrics: {:?}", metrics),
        Err(e) => error!("Shutdown failed: {}", e),
    }
    if let (Ok(_), Some(path)) = (&shutdown, &checkpoint_path) {
        save_checkpoint(path, &ingestor.progress()).context("Failed to save final checkpoint")?;
    }

    outcome?;
    shutdown.context("Failed to close sink")?;
    Ok(())
}

async fn run(
    ingestor: &mut Ingestor,
    tick_every: Duration,
    checkpoint_path: Option<&Path>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(tick_every);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    info!("Input closed");
                    return Ok(());
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<KeyedRecord>(&line) {
                    Ok(keyed) => block_in_place(|| ingestor.ingest(&keyed.key, keyed.value))?,
                    Err(e) => warn!("Skipping malformed record: {}", e),
                }
            }
            _ = ticker.tick() => {
                block_in_place(|| ingestor.tick())?;
                if let Some(path) = checkpoint_path {
                    ingestor.save_checkpoint(path)?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(());
            }
        }
    }
}

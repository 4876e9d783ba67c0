//! Zenoh bridge for De Dietrich Diematic boiler controllers.
//!
//! Polls the controller over Modbus RTU and publishes decoded snapshots to
//! InfluxDB or Zenoh, or only logs them.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use zenoh_bridge_diematic::config::{Backend, DiematicBridgeConfig};
use zenoh_bridge_diematic::poller::Poller;
use zenoh_bridge_diematic::sink::{InfluxSink, Sink, ZenohSink};
use zenoh_bridge_diematic::snapshot::SnapshotAssembler;

/// Zenoh bridge for Diematic boiler controllers (Modbus RTU).
#[derive(Parser, Debug)]
#[command(name = "zenoh-bridge-diematic")]
#[command(about = "Polls a Diematic boiler controller and publishes decoded snapshots")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "diematic.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Override the serial device (e.g., /dev/ttyUSB0).
    #[arg(short, long)]
    device: Option<String>,

    /// Override the publishing backend.
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Run a single cycle and exit, even if a poll interval is configured.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = DiematicBridgeConfig::load_from_file(
        &args.config,
        args.device.as_deref(),
        args.backend,
    )
    .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging
    let log_config = config
        .logging
        .clone()
        .with_level_override(args.log_level.as_deref());
    diematic_common::init_tracing(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting zenoh-bridge-diematic");
    info!("Loaded configuration from {:?}", args.config);

    let schema = Arc::new(config.schema().context("Invalid register schema")?);
    let device = config.device()?;
    info!(
        "Schema: {} entries, {} outputs; device {} (unit {})",
        schema.len(),
        schema.output_names().len(),
        device,
        config.modbus.unit
    );

    // Build the publishing sink
    let mut session = None;
    let sink = match config.backend {
        Backend::None => Sink::None,
        Backend::Influxdb => {
            let influx = config
                .influxdb
                .as_ref()
                .context("backend 'influxdb' requires an 'influxdb' section")?;
            info!("Publishing to InfluxDB at {}", influx.write_url());
            Sink::Influx(InfluxSink::new(influx).context("Failed to create InfluxDB client")?)
        }
        Backend::Zenoh => {
            info!("Connecting to Zenoh...");
            let zenoh = Arc::new(
                diematic_common::connect(&config.zenoh.session)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to connect to Zenoh: {}", e))?,
            );
            info!("Connected to Zenoh");

            let sink = ZenohSink::new(
                zenoh.clone(),
                &config.zenoh.key_prefix,
                &config.publish.measurement,
                config.zenoh.format,
            );
            info!("Publishing snapshots to '{}'", sink.key());
            session = Some(zenoh);
            Sink::Zenoh(sink)
        }
    };

    let assembler = SnapshotAssembler::new(
        config.publish.measurement.clone(),
        config.publish.resolved_tags(),
    );
    let poller = Poller::new(schema, config.modbus.clone(), assembler, sink);

    match config.poll_interval() {
        Some(interval) if !args.once => {
            tokio::select! {
                _ = poller.run(interval) => {}
                result = tokio::signal::ctrl_c() => {
                    result?;
                    info!("Received shutdown signal");
                }
            }
        }
        _ => {
            poller.poll_once().await;
        }
    }

    drop(poller);
    if let Some(session) = session {
        if let Err(e) = session.close().await {
            error!("Failed to close Zenoh session: {}", e);
        }
    }
    info!("Diematic bridge stopped");

    Ok(())
}

//! CLI entry point for labcon.
//!
//! Provides the scripted/command-line access mode:
//! - `run` opens every configured device and streams its events until
//!   interrupted, then closes everything down cleanly.
//! - `scan` executes the configured 2D grid scan and prints a per-row
//!   summary.
//!
//! # Usage
//!
//! ```bash
//! labcon run --config config/labcon.toml
//! labcon scan --config config/labcon.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use tracing::{info, warn};

use labcon::config::Settings;
use labcon::core::DeviceEvent;
use labcon::facade::DeviceFacade;
use labcon::logging;
use labcon::scan::{ScanEngine, ScanEvent};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "labcon")]
#[command(about = "Laboratory instrument control and 2D scanning", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "config/labcon.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open all configured devices and stream their events until ctrl-c.
    Run,
    /// Execute the configured 2D grid scan.
    Scan,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    info!(application = %settings.application.name, "starting");

    match cli.command {
        Commands::Run => run(settings).await,
        Commands::Scan => scan(settings).await,
    }
}

/// Open every configured device, print its event stream, shut down on
/// ctrl-c.
async fn run(settings: Settings) -> Result<()> {
    if settings.devices.is_empty() {
        bail!("no devices configured");
    }

    let facade = DeviceFacade::new(settings.control.clone());

    for definition in &settings.devices {
        facade
            .connect(definition)
            .await
            .with_context(|| format!("failed to open device '{}'", definition.name))?;

        let mut events = facade.subscribe(&definition.name).await?;
        let name = definition.name.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Status(status)) => {
                        info!(device = %name, state = ?status.state, telemetry = ?status.telemetry, "status");
                    }
                    Ok(DeviceEvent::Result(result)) => match &result.result {
                        Ok(payload) => {
                            info!(device = %name, id = %result.id, payload = ?payload, "command ok")
                        }
                        Err(err) => {
                            warn!(device = %name, id = %result.id, error = %err, "command failed")
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(device = %name, skipped = n, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    info!("devices open; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    facade.shutdown().await;
    Ok(())
}

/// Run the configured grid scan and print a per-row summary.
async fn scan(settings: Settings) -> Result<()> {
    let Some(scan_settings) = settings.scan.clone() else {
        bail!("no [scan] section in configuration");
    };

    let facade = DeviceFacade::new(settings.control.clone());

    let scan_devices: Vec<&str> = [scan_settings.x_motor.as_str(), scan_settings.y_motor.as_str()]
        .into_iter()
        .chain(scan_settings.scalers.iter().map(String::as_str))
        .collect();

    for definition in &settings.devices {
        if scan_devices.contains(&definition.name.as_str()) {
            facade
                .connect(definition)
                .await
                .with_context(|| format!("failed to open device '{}'", definition.name))?;
        }
    }

    let engine = ScanEngine::new(facade.clone());

    // Ctrl-c stops the scan at the next point boundary.
    let abort = engine.abort_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let mut events = engine.subscribe();
    let progress = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ScanEvent::RowStarted { row, y } => info!(row, y, "row started"),
                ScanEvent::RowFinished { row } => info!(row, "row finished"),
                ScanEvent::Aborted { row } => warn!(row, "scan aborted"),
                ScanEvent::Finished => info!("scan finished"),
                ScanEvent::PointMeasured(_) => {}
            }
        }
    });

    let outcome = engine.run(&scan_settings).await;
    drop(engine);
    let _ = progress.await;

    facade.shutdown().await;

    let grid = outcome.context("scan failed")?;
    for (row_index, row) in grid.rows.iter().enumerate() {
        let totals: Vec<f64> = grid
            .scalers
            .iter()
            .enumerate()
            .map(|(i, _)| row.iter().map(|p| p.counts[i]).sum())
            .collect();
        println!("row {row_index}: {} points, totals {totals:?}", row.len());
    }

    Ok(())
}

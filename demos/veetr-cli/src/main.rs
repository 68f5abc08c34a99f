//! Command-line controller for Veetr units.
//!
//! Commands:
//! - monitor: connect and print telemetry until interrupted
//! - version: print the unit's firmware version
//! - check: compare the unit's firmware with a release image
//! - update: upload a firmware image
//! - rename: change the unit's advertised name
//!
//! Run against the built-in simulated unit with `--transport sim`, or build
//! with `--features ble` to talk to real hardware.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use veetr_core::{Config, SessionStatus, Transport};
use veetr_firmware::{FirmwareUpdater, LocalRelease};
use veetr_session::{Session, SessionEvent};
use veetr_transport::SimulatedUnit;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum TransportKind {
    /// Bluetooth LE (needs the `ble` feature)
    #[default]
    Ble,
    /// In-process simulated unit
    Sim,
}

#[derive(Parser)]
#[command(name = "veetr")]
#[command(about = "Controller for Veetr units", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// How to reach the unit
    #[arg(short, long, value_enum, default_value_t = TransportKind::Ble)]
    transport: TransportKind,

    /// Only attach to units whose name contains this
    #[arg(long)]
    name: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print telemetry until interrupted
    Monitor {
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Print the unit's firmware version
    Version,
    /// Compare the unit's firmware with a release image
    Check {
        /// Firmware image
        image: PathBuf,
        /// Version of the image
        #[arg(long)]
        release: String,
    },
    /// Upload a firmware image
    Update {
        /// Firmware image
        image: PathBuf,
        /// Version of the image
        #[arg(long, default_value = "local")]
        release: String,
    },
    /// Change the unit's advertised name
    Rename { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if cli.name.is_some() {
        config.link.device_name = cli.name;
    }

    match cli.transport {
        TransportKind::Sim => {
            let unit = SimulatedUnit::new();
            feed_telemetry(unit.clone());
            run(unit, config, cli.command).await
        }
        #[cfg(feature = "ble")]
        TransportKind::Ble => {
            let transport = veetr_transport::BleTransport::new(config.link.clone());
            run(transport, config, cli.command).await
        }
        #[cfg(not(feature = "ble"))]
        TransportKind::Ble => {
            anyhow::bail!("built without BLE support; rebuild with --features ble or use --transport sim")
        }
    }
}

async fn run<T: Transport>(transport: T, config: Config, command: Commands) -> anyhow::Result<()> {
    let session = Arc::new(Session::new(transport, config.link));
    tracing::info!("Connecting...");
    session.connect().await.context("connecting to unit")?;
    if let Some(label) = session.snapshot().await.device_label {
        tracing::info!(%label, "Connected");
    }

    let updater = FirmwareUpdater::new(Arc::clone(&session), config.transfer);
    let result: anyhow::Result<()> = async {
        match command {
            Commands::Monitor { duration } => monitor(&session, duration).await?,
            Commands::Version => println!("{}", updater.current_version().await?),
            Commands::Check { image, release } => {
                let check = updater
                    .check_for_update(&LocalRelease::new(release, image))
                    .await?;
                println!("{}", serde_json::to_string_pretty(&check)?);
            }
            Commands::Update { image, release } => update(&updater, image, release).await?,
            Commands::Rename { name } => {
                session.set_device_name(&name).await?;
                println!("Name set to {}; the unit advertises it after restarting", name.trim());
            }
        }
        Ok(())
    }
    .await;

    session.disconnect().await;
    result
}

async fn monitor<T: Transport>(session: &Session<T>, duration: Option<u64>) -> anyhow::Result<()> {
    use futures::StreamExt;

    let mut frames = session.telemetry().history_plus_stream();
    let mut events = session.events();
    let deadline = duration.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let until = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(until);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            () = &mut until => break,
            Some(frame) = frames.next() => println!("{}", serde_json::to_string(&frame)?),
            Ok(event) = events.recv() => {
                if let SessionEvent::Disconnected { reason } = event {
                    anyhow::bail!("link ended: {reason:?}");
                }
            }
        }
    }

    let snapshot = session.snapshot().await;
    tracing::info!(
        signal = ?snapshot.signal_level,
        quality = ?snapshot.signal_quality,
        "Monitor finished"
    );
    Ok(())
}

async fn update<T: Transport>(
    updater: &FirmwareUpdater<T>,
    image: PathBuf,
    release: String,
) -> anyhow::Result<()> {
    let mut progress = updater.progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = progress.borrow_and_update().clone();
            if let Some(p) = current {
                println!("[{:>3}%] {}", p.percent, p.message);
            }
        }
    });

    let source = LocalRelease::new(release.clone(), image);
    let outcome = tokio::select! {
        outcome = updater.update_from_release(&source, Some(&release)) => outcome,
        _ = tokio::signal::ctrl_c() => {
            updater.abort();
            anyhow::bail!("update interrupted");
        }
    };
    let job = outcome.map_err(|e| {
        tracing::error!("Update failed: {e}");
        e
    })?;
    reporter.abort();

    println!(
        "Uploaded {} bytes in {:.1}s",
        job.total_bytes(),
        job.elapsed().as_secs_f64()
    );
    if updater.session().status().await == SessionStatus::Connected {
        tracing::warn!("Unit still connected after apply; it may not have restarted");
    }
    Ok(())
}

/// Make the simulated unit stream something to look at.
fn feed_telemetry(unit: SimulatedUnit) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut heading = 0.0_f64;
        loop {
            tick.tick().await;
            if !unit.is_linked() {
                continue;
            }
            heading = (heading + 7.5) % 360.0;
            unit.send_telemetry(&serde_json::json!({
                "rssi": -58,
                "speed": 4.2,
                "heading": heading,
                "heel": 3.5,
                "windSpeed": 11.8,
                "windDirection": 215,
            }));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_still_disconnects() {
        let unit = SimulatedUnit::new();
        let result = run(
            unit.clone(),
            Config::default(),
            Commands::Rename {
                name: "bad/name".into(),
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(unit.attach_count(), 1);
        assert_eq!(unit.close_count(), 1);
        assert!(!unit.is_linked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_version_command() {
        let unit = SimulatedUnit::new();
        tokio_test::assert_ok!(run(unit.clone(), Config::default(), Commands::Version).await);
        assert!(!unit.is_linked());
    }
}

//! camctl
//!
//! HTTP control plane for a single capture device: live preview through an
//! external streamer and segmented recording through the camera.

mod capture;
mod config;
mod control;
mod logging;
mod server;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use capture::{CommandCamera, SystemDiskSpace};
use config::{Cli, Config};
use control::Controller;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init_logging()?;
    if let Ok(log_dir) = logging::get_log_dir() {
        info!("Logging to {:?}", log_dir);
    }

    let config = Config::from_cli(&cli)?;
    if let Some(path) = config.config_path() {
        info!("Loaded config from {:?}", path);
    }
    let settings = config
        .control_settings()
        .context("Invalid configuration")?;

    info!("camctl starting...");
    info!("Preview command: {}", settings.preview_command);
    info!("Recordings folder: {:?}", settings.recordings_folder);
    info!(
        "Segment length: {:?}, bitrate: {}",
        settings.segment_duration, settings.bitrate
    );

    let camera = CommandCamera::new(
        &config.recording.device,
        config.recording.command.clone(),
        settings.timings.preview_grace(),
    );
    let controller = Arc::new(Controller::new(
        settings,
        Arc::new(camera),
        Arc::new(SystemDiskSpace),
    ));

    // Ctrl+C handling
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Ctrl+C received, shutting down...");
        let _ = shutdown_tx.send(true);
    })
    .context("Failed to install Ctrl+C handler")?;

    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address()))?;

    let shutdown = async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
    };
    if let Err(e) = server::serve(listener, controller.clone(), shutdown).await {
        warn!("Server stopped with error: {:#}", e);
    }

    controller.shutdown().await;
    info!("camctl stopped");
    Ok(())
}

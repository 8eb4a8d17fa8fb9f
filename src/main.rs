//! CLI entry point for the Pilatus frame streamer.
//!
//! Watches the detector's output folder, relays the control connection for
//! one client and publishes every image to subscribers.
//!
//! # Usage
//!
//! ```bash
//! pilatus-streamer -f /ramdisk/images -t cbf -s 2m
//! pilatus-streamer --config /etc/pilatus/streamer.toml --compression
//! ```
//!
//! Settings come from (later wins): built-in defaults, the `--config` TOML
//! file, `PILATUS_*` environment variables, command-line flags.

// Global allocator for the frame-rate allocation pattern of the publisher
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use pilatus_core::{DetectorSize, LogFormat, SourceFormat, StreamerConfig};
use pilatus_pool::BufferPool;
use pilatus_streamer::monitor::MonitorServer;
use pilatus_streamer::orchestrator::{Streamer, StreamerIo};
use pilatus_streamer::tracing_setup::{self, TracingConfig};
use pilatus_streamer::transport::tcp::TcpFanOut;
use pilatus_streamer::watcher::FolderWatcher;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pilatus-streamer")]
#[command(about = "Stream Pilatus detector images to network subscribers", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder the detector writes images into
    #[arg(short = 'f', long)]
    folder: Option<PathBuf>,

    /// Image file format: tif or cbf
    #[arg(short = 't', long)]
    format: Option<SourceFormat>,

    /// Detector model: 100k, 1m or 2m
    #[arg(short = 's', long)]
    size: Option<DetectorSize>,

    /// LZ4-compress raw (TIFF) payloads before publishing
    #[arg(long)]
    compression: bool,

    /// Log output format: pretty, compact or json
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn apply(self, config: &mut StreamerConfig) {
        if let Some(folder) = self.folder {
            config.watch_folder = folder;
        }
        if let Some(format) = self.format {
            config.format = format;
        }
        if let Some(size) = self.size {
            config.detector = size;
        }
        if self.compression {
            config.compression = true;
        }
        if let Some(log_format) = self.log_format {
            config.log_format = log_format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        StreamerConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    tracing_setup::init(TracingConfig::from_streamer_config(&config)?)?;
    info!(
        folder = %config.watch_folder.display(),
        format = %config.format,
        detector = ?config.detector,
        compression = config.compression,
        "Starting Pilatus streamer"
    );

    let pool = BufferPool::new(config.pool_size, config.buffer_capacity());

    // Dropping the watcher stops the watch, so it lives until main returns
    let (_watcher, watch_events) = FolderWatcher::new(&config.watch_folder, config.pool_size)?;

    let publisher = TcpFanOut::bind(config.publish_addr.as_str(), config.pool_size)
        .await
        .with_context(|| format!("Failed to bind publisher on {}", config.publish_addr))?;
    let (_monitor, monitor_requests) = MonitorServer::bind(config.monitor_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind monitor on {}", config.monitor_addr))?;
    let client_listener = TcpListener::bind(config.client_listen_addr.as_str())
        .await
        .with_context(|| format!("Failed to listen on {}", config.client_listen_addr))?;
    let control = TcpStream::connect(config.control_addr.as_str())
        .await
        .with_context(|| format!("Failed to connect to camserver at {}", config.control_addr))?;
    info!(camserver = %config.control_addr, "Connected to detector control server");

    let streamer = Streamer::new(
        &config,
        pool,
        publisher,
        StreamerIo {
            client_listener,
            control,
            watch_events,
            monitor_requests,
        },
    );

    let (stop_tx, stop_rx) = oneshot::channel();
    let signal_pool = streamer.pool();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                // Also wakes the streamer if it is waiting for a buffer
                signal_pool.shutdown();
                let _ = stop_tx.send(());
            }
            Err(e) => error!(error = %e, "Failed to install Ctrl+C handler"),
        }
    });

    streamer
        .run(async {
            if stop_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Pilatus streamer stopped");
    Ok(())
}

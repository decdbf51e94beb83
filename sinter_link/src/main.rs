//! # Sinter Link Device Endpoint
//!
//! Serves an MCU backend to the host over a Unix socket: one connection per
//! command channel plus one event connection.
//!
//! # Usage
//!
//! ```bash
//! # Simulated MCU on the default socket
//! sinter_link
//!
//! # Explicit socket, 8 channels, verbose JSON logs
//! sinter_link --socket /tmp/sinter.sock --channels 8 -v --json
//!
//! # Settings from a host config file
//! sinter_link --config /etc/sinter/host.toml
//! ```

#![deny(warnings)]

use clap::Parser;
use sinter_common::catalog::CommandCatalog;
use sinter_common::config::HostConfig;
use sinter_common::consts::CANCEL_POLL_MS;
use sinter_link::{BackendOptions, BackendRegistry, DeviceEndpoint};
use std::io::ErrorKind;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Sinter Link - device-side MCU endpoint
#[derive(Parser, Debug)]
#[command(name = "sinter_link")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Device-side endpoint serving an MCU backend over a Unix socket")]
#[command(long_about = None)]
struct Args {
    /// Host configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Unix socket path; overrides `link.socket_path`.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Expected command channels; overrides `link.channels`.
    #[arg(long)]
    channels: Option<usize>,

    /// Backend to serve
    #[arg(short, long, default_value = "simulation")]
    backend: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("Link endpoint failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_tracing(&args);

    info!("Sinter Link v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => HostConfig::load_validated(path)?,
        None => HostConfig::default(),
    };
    let socket = args
        .socket
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.link.socket_path));
    let channels = args.channels.unwrap_or_else(|| config.link.effective_channels());

    let registry = BackendRegistry::with_builtin();
    let options = BackendOptions {
        catalog: Arc::new(CommandCatalog::builtin()),
        clock_sync_interval: Duration::from_millis(u64::from(config.link.clock_sync_interval_ms)),
        warn_threshold: config.link.outstanding_warn_threshold,
    };
    info!("Backends available: {:?}", registry.list());
    let backend = registry.create(&args.backend, &options)?;
    let device = DeviceEndpoint::new(backend)?;

    if socket.exists() {
        warn!("Removing stale socket {}", socket.display());
        std::fs::remove_file(&socket)?;
    }
    let listener = UnixListener::bind(&socket)?;
    listener.set_nonblocking(true)?;
    info!(
        "Serving backend '{}' on {} ({} command channels expected)",
        args.backend,
        socket.display(),
        channels
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                if let Err(e) = device.serve_connection(stream) {
                    warn!("Rejected connection: {}", e);
                    continue;
                }
                if device.command_streams() > channels {
                    warn!(
                        "{} command streams attached, more than the {} expected",
                        device.command_streams(),
                        channels
                    );
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(CANCEL_POLL_MS));
            }
            Err(e) => {
                error!("Accept failed: {}", e);
                break;
            }
        }
    }

    device.shutdown();
    if let Err(e) = std::fs::remove_file(&socket) {
        debug!("Socket cleanup skipped: {}", e);
    }
    info!("Sinter Link shutdown complete");
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

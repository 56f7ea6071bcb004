//! Vitals Daemon - Live Vehicle Telemetry over WebSocket
//!
//! Accepts WebSocket clients and runs one telemetry session per connection.
//! Clients send `start <sensor>` / `stop <sensor>` and receive a reading per
//! sensor every update interval.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (simulated source on 0.0.0.0:8001)
//! vitals-daemon
//!
//! # Talk to a WiFi ELM327 adapter
//! vitals-daemon --source elm327 --source-addr 192.168.0.10:35000
//!
//! # Faster updates, tighter query budget
//! vitals-daemon --update-interval 0.5 --command-timeout 5
//!
//! # With config file
//! vitals-daemon --config /etc/vroom-vitals/vitals.toml
//!
//! # Verbose logging
//! RUST_LOG=debug vitals-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (every session stops its
//!   streams and closes its source before the process exits)

mod server;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use vitals_core::{load_config, load_config_from_path, ConfigOverrides, SourceKind};

use server::DaemonServer;

/// Vitals Daemon - streams live OBD-II readings to WebSocket clients
#[derive(Parser, Debug)]
#[command(name = "vitals-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to bind
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Port to bind
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "VITALS_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Seconds between readings of one sensor
    #[arg(long, value_name = "SECS")]
    update_interval: Option<f64>,

    /// Upper bound in seconds on a single sensor query
    #[arg(long, value_name = "SECS")]
    command_timeout: Option<f64>,

    /// Sensor queries allowed in flight at once
    #[arg(long, value_name = "N")]
    max_tasks: Option<usize>,

    /// Streams allowed per session
    #[arg(long, value_name = "N")]
    max_streams: Option<usize>,

    /// Telemetry source (simulated, elm327)
    #[arg(long, value_name = "KIND")]
    source: Option<SourceKind>,

    /// ELM327 adapter address
    #[arg(long, value_name = "HOST:PORT")]
    source_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "VITALS_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line values that take precedence over file and environment
    fn overrides(&self) -> Result<ConfigOverrides> {
        let mut overrides = ConfigOverrides::new();

        if let Some(ref host) = self.host {
            overrides = overrides.with_host(host.clone());
        }
        if let Some(port) = self.port {
            overrides = overrides.with_port(port);
        }
        if let Some(secs) = self.update_interval {
            overrides = overrides.with_update_interval(
                seconds(secs).context("Invalid --update-interval")?,
            );
        }
        if let Some(secs) = self.command_timeout {
            overrides = overrides.with_command_timeout(
                seconds(secs).context("Invalid --command-timeout")?,
            );
        }
        if let Some(tasks) = self.max_tasks {
            overrides = overrides.with_max_concurrent_tasks(tasks);
        }
        if let Some(streams) = self.max_streams {
            overrides = overrides.with_max_concurrent_streams(streams);
        }
        if let Some(kind) = self.source {
            overrides = overrides.with_source_kind(kind);
        }
        if let Some(ref address) = self.source_addr {
            overrides = overrides.with_source_address(address.clone());
        }

        Ok(overrides)
    }
}

fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).with_context(|| format!("{secs} is not a valid duration"))
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("vitals_daemon={level},vitals_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("Vitals Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let mut config = match args.config {
        Some(ref path) => load_config_from_path(Some(path.clone())),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    args.overrides()?.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        origin = ?config.source(),
        config_path = ?config.config_file_path,
        bind = %config.server.bind_address(),
        source = %config.source.kind,
        update_interval_ms = config.streaming.update_interval.as_millis(),
        command_timeout_ms = config.streaming.command_timeout.as_millis(),
        max_tasks = config.streaming.max_concurrent_tasks,
        max_streams = config.streaming.max_concurrent_streams,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        signal_token.cancel();
    });

    let server = DaemonServer::new(config);
    let result = server.run(shutdown).await;

    match result {
        Ok(()) => {
            info!("Vitals daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vitals_core::VitalsConfig;

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "vitals-daemon",
            "--port",
            "9001",
            "--update-interval",
            "0.25",
            "--max-streams",
            "2",
            "--source",
            "elm327",
        ])
        .unwrap();

        let mut config = VitalsConfig::default();
        args.overrides().unwrap().apply(&mut config);

        assert_eq!(config.server.port, 9001);
        assert_eq!(config.streaming.update_interval, Duration::from_millis(250));
        assert_eq!(config.streaming.max_concurrent_streams, 2);
        assert_eq!(config.source.kind, SourceKind::Elm327);
    }

    #[test]
    fn test_unknown_source_rejected() {
        assert!(Args::try_parse_from(["vitals-daemon", "--source", "carrier-pigeon"]).is_err());
    }

    #[test]
    fn test_negative_interval_rejected() {
        let args = Args::try_parse_from(["vitals-daemon", "--update-interval=-1"]).unwrap();
        assert!(args.overrides().is_err());
    }
}

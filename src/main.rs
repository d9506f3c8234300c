//! # UAVTalk GCS
//!
//! Ground-station telemetry daemon for UAVTalk flight controllers.
//!
//! Connects to the flight controller over a serial port or TCP, keeps the
//! local object catalog in sync with the flight side and optionally logs
//! objects to JSONL files.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use uavtalk_gcs::config::{Config, LinkKind, LoggingConfig};
use uavtalk_gcs::link;
use uavtalk_gcs::telemetry::{ObjectLogger, Telemetry};
use uavtalk_gcs::uavobject::{ObjectManager, UavObject};
use uavtalk_gcs::uavobjects::catalog;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "uavtalk-gcs", version, about = "UAVTalk ground-control telemetry")]
struct Args {
    /// Configuration file (TOML); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connect over this serial device instead of the configured link
    #[arg(long, conflicts_with = "tcp")]
    serial: Option<String>,

    /// Connect to this host:port instead of the configured link
    #[arg(long)]
    tcp: Option<String>,
}

impl Args {
    /// Apply link overrides from the command line
    fn apply(&self, config: &mut Config) {
        if let Some(port) = &self.serial {
            config.link.kind = LinkKind::Serial;
            config.link.port = port.clone();
        }
        if let Some(address) = &self.tcp {
            config.link.kind = LinkKind::Tcp;
            config.link.address = address.clone();
        }
    }
}

/// Main entry point for the UAVTalk GCS
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration and apply command line overrides
///    - Set up logging (console, plus daily files when `log_dir` is set)
///    - Register the object catalog and attach the telemetry engine
///
/// 2. **Link Loop**
///    - Open the serial or TCP link
///    - Run telemetry until the link fails
///    - Wait `reconnect_interval_ms` and try again
///
/// 3. **Graceful Shutdown**
///    - Ctrl+C cancels the link, pending transactions fail, clean exit
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let _log_guard = init_logging(&config.logging);
    info!("UAVTalk GCS v{} starting...", env!("CARGO_PKG_VERSION"));

    let manager = Arc::new(catalog()?);
    info!("Registered {} object types", manager.num_types());
    trace_updates(&manager);

    let telemetry = Telemetry::new(manager.clone(), &config.telemetry);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, shutting down...");
                    cancel.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl+C: {}", e),
            }
        }
    });

    if config.object_log.enabled {
        let logger = Arc::new(ObjectLogger::new(&config.object_log)?);
        logger.attach(&manager);
        tokio::spawn(run_object_log(
            logger,
            manager.clone(),
            config.telemetry.scheduler_tick(),
            cancel.clone(),
        ));
    }

    loop {
        info!("Connecting to {}", link::describe(&config.link));

        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = link::open(&config.link) => opened,
        };

        match opened {
            Ok((reader, writer)) => {
                if let Err(e) = telemetry.run(reader, writer, cancel.clone()).await {
                    warn!("Link lost: {}", e);
                }
                let stats = telemetry.stats();
                info!(
                    "Link stats: sent {} objects ({} bytes), received {} objects ({} bytes), {} rx errors, {} tx errors",
                    stats.tx_objects,
                    stats.tx_bytes,
                    stats.rx_objects,
                    stats.rx_bytes,
                    stats.rx_errors,
                    stats.tx_errors
                );
            }
            Err(e) => warn!("Failed to open link: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.link.reconnect_interval()) => {}
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Install the tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level. The returned
/// guard flushes the file writer on drop.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter).with(fmt::layer());

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "uavtalk-gcs.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

/// Log every object update at debug level
fn trace_updates(manager: &ObjectManager) {
    fn watch(obj: &UavObject) {
        obj.add_updated_observer(|o| debug!("{} {} updated", o.name(), o.key()));
    }

    for obj in manager.get_objects().into_iter().flatten() {
        watch(&obj);
    }
    manager.on_new_object(|obj| watch(obj));
    manager.on_new_instance(|obj| {
        debug!("New instance {} {}", obj.name(), obj.key());
        watch(obj);
    });
}

/// Drive PERIODIC object logging until cancelled
async fn run_object_log(
    logger: Arc<ObjectLogger>,
    manager: Arc<ObjectManager>,
    tick: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(tick);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = logger.poll(&manager, Instant::now()) {
                    warn!("Object log write failed: {}", e);
                }
            }
        }
    }
    info!("Object log closed after {} records", logger.records_written());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments_keeps_config() {
        let args = Args::try_parse_from(["uavtalk-gcs"]).unwrap();
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_serial_override() {
        let args = Args::try_parse_from(["uavtalk-gcs", "--serial", "/dev/ttyACM1"]).unwrap();
        let mut config = Config::default();
        config.link.kind = LinkKind::Tcp;
        args.apply(&mut config);
        assert_eq!(config.link.kind, LinkKind::Serial);
        assert_eq!(config.link.port, "/dev/ttyACM1");
    }

    #[test]
    fn test_tcp_override() {
        let args = Args::try_parse_from(["uavtalk-gcs", "-c", "gcs.toml", "--tcp", "10.0.0.2:9000"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("gcs.toml")));

        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.link.kind, LinkKind::Tcp);
        assert_eq!(config.link.address, "10.0.0.2:9000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serial_and_tcp_conflict() {
        assert!(Args::try_parse_from(["uavtalk-gcs", "--serial", "/dev/ttyUSB0", "--tcp", "a:1"]).is_err());
    }
}

//! # Link Module
//!
//! Byte transport between the ground station and the flight controller.
//!
//! This module handles:
//! - Opening a serial port (8N1, no flow control)
//! - Opening a TCP stream (telemetry bridges, simulators)
//! - Splitting the stream into independent reader and writer halves

pub mod port_trait;

pub use port_trait::{LinkReader, LinkWriter, StreamReader, StreamWriter};

use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::config::{LinkConfig, LinkKind};
use crate::error::{GcsError, Result};

/// Serial devices tried when no port is configured (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &["/dev/ttyUSB0", "/dev/ttyACM0"];

/// Boxed reader and writer halves of an open link
pub type LinkHalves = (Box<dyn LinkReader>, Box<dyn LinkWriter>);

/// Open the link described by the configuration
///
/// # Errors
///
/// Returns `Serial` if no serial device could be opened, or `Io` if the TCP
/// connection fails.
pub async fn open(config: &LinkConfig) -> Result<LinkHalves> {
    match config.kind {
        LinkKind::Serial => {
            if config.port.is_empty() {
                open_serial_with_paths(DEFAULT_DEVICE_PATHS, config.baud_rate)
            } else {
                open_serial_with_paths(&[config.port.as_str()], config.baud_rate)
            }
        }
        LinkKind::Tcp => open_tcp(&config.address).await,
    }
}

/// Human-readable endpoint for log messages
pub fn describe(config: &LinkConfig) -> String {
    match config.kind {
        LinkKind::Serial if config.port.is_empty() => {
            format!("serial (auto: {})", DEFAULT_DEVICE_PATHS.join(", "))
        }
        LinkKind::Serial => format!("serial {} @ {} baud", config.port, config.baud_rate),
        LinkKind::Tcp => format!("tcp {}", config.address),
    }
}

/// Open the first serial device in `paths` that can be opened
pub fn open_serial_with_paths(paths: &[&str], baud_rate: u32) -> Result<LinkHalves> {
    for path in paths {
        debug!("Trying to open serial port: {}", path);

        match open_port(path, baud_rate) {
            Ok(port) => {
                info!("Opened serial link at {} ({} baud)", path, baud_rate);
                let (reader, writer) = tokio::io::split(port);
                return Ok((
                    Box::new(StreamReader::new(reader)),
                    Box::new(StreamWriter::new(writer)),
                ));
            }
            Err(e) => {
                warn!("Failed to open {}: {}", path, e);
            }
        }
    }

    Err(GcsError::Serial(format!(
        "No serial device could be opened (tried: {})",
        paths.join(", ")
    )))
}

fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
    tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| GcsError::Serial(format!("Failed to open {}: {}", path, e)))
}

/// Connect to a TCP endpoint such as a telemetry bridge or simulator
pub async fn open_tcp(address: &str) -> Result<LinkHalves> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    info!("Connected TCP link to {}", address);

    let (reader, writer) = stream.into_split();
    Ok((
        Box::new(StreamReader::new(reader)),
        Box::new(StreamWriter::new(writer)),
    ))
}

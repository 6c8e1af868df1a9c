//! # Serial Communication Module
//!
//! Opens the serial link to the ELM327 OBD adapter.
//!
//! This module handles:
//! - Opening the adapter port (USB serial or rfcomm Bluetooth)
//! - 8N1 framing at the configured baud rate
//! - Falling back across candidate device paths

pub mod port_trait;

use crate::error::{CollectorError, Result};
use port_trait::{SerialPortIO, TokioSerialPort};
use tracing::{debug, info, warn};

/// Default adapter paths to try when none is configured (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyUSB0",  // USB ELM327 cables
    "/dev/rfcomm0",  // Bluetooth ELM327 dongles bound with rfcomm
];

/// Configured port value that tries every default path in turn
pub const AUTO_DETECT: &str = "auto";

/// Open the configured adapter, detecting it when the path is `auto`
///
/// # Errors
///
/// - `SerialPortNotFound` if auto detection finds nothing
/// - `Serial` if an explicit path cannot be opened
pub fn open_configured(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
    if path == AUTO_DETECT {
        let (found, port) = open_with_paths(DEFAULT_DEVICE_PATHS, baud_rate)?;
        debug!("Auto-detected OBD adapter at {}", found);
        Ok(port)
    } else {
        open(path, baud_rate)
    }
}

/// Open the adapter at `path`
///
/// # Errors
///
/// Returns `CollectorError::Serial` if the port cannot be opened
pub fn open(path: &str, baud_rate: u32) -> Result<Box<dyn SerialPortIO>> {
    let port = open_port(path, baud_rate)?;
    info!("Opened OBD adapter at {} ({} baud)", path, baud_rate);
    Ok(Box::new(TokioSerialPort::new(port)))
}

/// Open the first adapter path that works
///
/// # Errors
///
/// Returns `CollectorError::SerialPortNotFound` listing every path tried
pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<(String, Box<dyn SerialPortIO>)> {
    for path in paths {
        debug!("Trying to open serial port: {}", path);

        match open(path, baud_rate) {
            Ok(port) => return Ok((path.to_string(), port)),
            Err(e) => {
                warn!("Failed to open {}: {}", path, e);
                continue;
            }
        }
    }

    Err(CollectorError::SerialPortNotFound(paths.join(", ")))
}

/// Open a specific serial port with ELM327 settings
fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| CollectorError::Serial(format!("Failed to open {}: {}", path, e)))?;

    Ok(port)
}

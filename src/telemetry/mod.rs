//! # Telemetry Module
//!
//! Turns sampled values into trip files on local storage.
//!
//! This module handles:
//! - Formatting header and data rows with a fixed column layout
//! - Queuing rows without blocking the sampling loop
//! - Appending rows to the trip file and keeping its header correct

pub mod formatter;
pub mod writer;

pub use formatter::{device_time, GlobalLabel, RecordFormatter, DEVICE_TIME_LABEL, TIME_FORMAT};
pub use writer::{DurableWriter, WriterStats};

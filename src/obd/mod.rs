//! # OBD Device Module
//!
//! Boundary to the diagnostic adapter.
//!
//! This module handles:
//! - The `DiagnosticDevice` trait the acquisition session drives
//! - Connection status reported by the adapter
//! - The ELM327 serial implementation (see [`elm327`])

pub mod elm327;

use async_trait::async_trait;

use crate::catalog::Parameter;
use crate::error::Result;

/// Connection status reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// No adapter answered
    NotConnected,
    /// Adapter answers but the vehicle bus does not
    ElmConnected,
    /// Adapter and vehicle both answer
    CarConnected,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DeviceStatus::NotConnected => "Not Connected",
            DeviceStatus::ElmConnected => "ELM Connected",
            DeviceStatus::CarConnected => "Car Connected",
        };
        f.write_str(text)
    }
}

/// Diagnostic adapter operations
///
/// Queries return the adapter's raw value text; `Ok(None)` means the vehicle
/// gave no data for the request.
#[async_trait]
pub trait DiagnosticDevice: Send {
    /// Open the link to the adapter at `path`
    async fn connect(&mut self, path: &str) -> Result<()>;

    async fn status(&mut self) -> DeviceStatus;

    async fn is_connected(&mut self) -> bool {
        self.status().await == DeviceStatus::CarConnected
    }

    async fn supports(&mut self, param: &Parameter) -> bool;

    /// Request a value; `force` skips the support check
    async fn query(&mut self, param: &Parameter, force: bool) -> Result<Option<String>>;

    async fn read_fault_codes(&mut self) -> Result<Vec<String>>;

    async fn clear_fault_codes(&mut self) -> Result<()>;

    /// Add a parameter to the polling engine's list
    async fn watch(&mut self, param: &Parameter);

    async fn start_polling(&mut self) -> Result<()>;

    async fn stop_polling(&mut self);

    async fn unwatch_all(&mut self);

    async fn close(&mut self);
}

/// Creates a fresh, unconnected device for each acquisition session
pub trait DeviceFactory: Send + Sync {
    fn create(&self) -> Box<dyn DiagnosticDevice>;
}

//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{CollectorError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub recording: RecordingConfig,

    #[serde(default)]
    pub positioning: PositioningConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub notification: NotificationConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OBD adapter configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    /// Adapter path, or `auto` to try the usual USB and rfcomm paths
    #[serde(default = "default_device_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Status polls allowed before the session gives up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,

    /// Wait after opening the adapter before the first status poll
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_reconnect_cooldown_ms")]
    pub reconnect_cooldown_ms: u64,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Pause between two passes of the polling engine over watched PIDs
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
}

/// Trip file separator
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Separator {
    #[default]
    Tab,
    Comma,
    Pipe,
}

impl Separator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Separator::Tab => "\t",
            Separator::Comma => ",",
            Separator::Pipe => "|",
        }
    }
}

/// Trip recording configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_recording_dir")]
    pub directory: String,

    #[serde(default = "default_extension")]
    pub extension: String,

    #[serde(default)]
    pub separator: Separator,

    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    #[serde(default = "default_final_drain_timeout_ms")]
    pub final_drain_timeout_ms: u64,

    #[serde(default)]
    pub car_id: String,
}

/// gpsd configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PositioningConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_gpsd_host")]
    pub gpsd_host: String,

    #[serde(default = "default_gpsd_port")]
    pub gpsd_port: u16,

    /// Longest wait for one fix before the stop flag is checked again
    #[serde(default = "default_fix_timeout_ms")]
    pub fix_timeout_ms: u64,
}

/// Object store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub access_key_id: String,

    #[serde(default)]
    pub secret_access_key: String,

    /// Key prefix: objects land at `<root>/<device_id>/<filename>`
    #[serde(default = "default_storage_root")]
    pub root: String,

    #[serde(default)]
    pub device_id: String,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Emit a warning every N failed reachability probes
    #[serde(default = "default_probe_warn_every")]
    pub probe_warn_every: u64,
}

/// Downstream notification configuration
#[derive(Debug, Deserialize, Clone)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_notification_path")]
    pub path: String,

    #[serde(default = "default_secret_header")]
    pub secret_header: String,

    #[serde(default)]
    pub secret: String,

    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

/// Command surface configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    #[serde(default)]
    pub secret: String,
}

/// Catalog narrowing
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CatalogConfig {
    /// Parameter names to record, empty means the whole standard catalog
    #[serde(default)]
    pub parameters: Vec<String>,
}

/// Process logging
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files, console only when unset
    #[serde(default)]
    pub log_dir: Option<String>,
}

// Default value functions
fn default_device_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { 38400 }
fn default_connect_attempts() -> u32 { 60 }
fn default_status_poll_interval_ms() -> u64 { 1000 }
fn default_settle_ms() -> u64 { 2000 }
fn default_reconnect_cooldown_ms() -> u64 { 7000 }
fn default_response_timeout_ms() -> u64 { 5000 }
fn default_polling_interval_ms() -> u64 { 250 }

fn default_recording_dir() -> String { "./recordings".to_string() }
fn default_extension() -> String { "csv".to_string() }
fn default_sample_interval_ms() -> u64 { 500 }
fn default_queue_capacity() -> usize { 1024 }
fn default_drain_interval_ms() -> u64 { 2000 }
fn default_final_drain_timeout_ms() -> u64 { 1000 }

fn default_gpsd_host() -> String { "127.0.0.1".to_string() }
fn default_gpsd_port() -> u16 { 2947 }
fn default_fix_timeout_ms() -> u64 { 1000 }

fn default_storage_endpoint() -> String { "https://s3.amazonaws.com".to_string() }
fn default_region() -> String { "us-east-1".to_string() }
fn default_storage_root() -> String { "trips".to_string() }
fn default_probe_interval_ms() -> u64 { 5000 }
fn default_probe_timeout_ms() -> u64 { 3000 }
fn default_probe_warn_every() -> u64 { 50 }

fn default_notification_path() -> String { "trips".to_string() }
fn default_secret_header() -> String { "X-Collector-Secret".to_string() }
fn default_retry_initial_ms() -> u64 { 2500 }
fn default_retry_multiplier() -> f64 { 2.0 }
fn default_retry_max_delay_ms() -> u64 { 60_000 }
fn default_retry_max_attempts() -> u32 { 20 }

fn default_server_enabled() -> bool { true }
fn default_bind_address() -> String { "0.0.0.0".to_string() }
fn default_server_port() -> u16 { 5050 }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: default_device_port(),
            baud_rate: default_baud_rate(),
            connect_attempts: default_connect_attempts(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            settle_ms: default_settle_ms(),
            reconnect_cooldown_ms: default_reconnect_cooldown_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            polling_interval_ms: default_polling_interval_ms(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_recording_dir(),
            extension: default_extension(),
            separator: Separator::default(),
            sample_interval_ms: default_sample_interval_ms(),
            queue_capacity: default_queue_capacity(),
            drain_interval_ms: default_drain_interval_ms(),
            final_drain_timeout_ms: default_final_drain_timeout_ms(),
            car_id: String::new(),
        }
    }
}

impl Default for PositioningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gpsd_host: default_gpsd_host(),
            gpsd_port: default_gpsd_port(),
            fix_timeout_ms: default_fix_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_storage_endpoint(),
            bucket: String::new(),
            region: default_region(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            root: default_storage_root(),
            device_id: String::new(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_warn_every: default_probe_warn_every(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            path: default_notification_path(),
            secret_header: default_secret_header(),
            secret: String::new(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            bind_address: default_bind_address(),
            port: default_server_port(),
            secret: String::new(),
        }
    }
}

impl RecordingConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn final_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.final_drain_timeout_ms)
    }
}

fn invalid(msg: impl std::fmt::Display) -> CollectorError {
    CollectorError::Config(toml::de::Error::custom(msg))
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(format!("{} must be between {} and {}", name, min, max)));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use obd_collector::config::Config;
    ///
    /// let config = Config::load("config/collector.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.device.port.is_empty() {
            return Err(invalid("device port cannot be empty"));
        }

        if ![9600, 38400, 115200, 230400, 500000].contains(&self.device.baud_rate) {
            return Err(invalid("baud_rate must be one of: 9600, 38400, 115200, 230400, 500000"));
        }

        if self.device.connect_attempts == 0 {
            return Err(invalid("connect_attempts must be greater than 0"));
        }

        check_range("status_poll_interval_ms", self.device.status_poll_interval_ms, 1, 60_000)?;
        check_range("settle_ms", self.device.settle_ms, 0, 60_000)?;
        check_range("reconnect_cooldown_ms", self.device.reconnect_cooldown_ms, 0, 300_000)?;
        check_range("response_timeout_ms", self.device.response_timeout_ms, 1, 60_000)?;
        check_range("polling_interval_ms", self.device.polling_interval_ms, 1, 60_000)?;

        if self.recording.enabled {
            if self.recording.directory.is_empty() {
                return Err(invalid("recording directory cannot be empty when enabled"));
            }
            if self.recording.extension.is_empty() || self.recording.extension.contains('.') {
                return Err(invalid("recording extension must be non-empty and without a dot"));
            }
        }

        check_range("sample_interval_ms", self.recording.sample_interval_ms, 1, 60_000)?;
        check_range("drain_interval_ms", self.recording.drain_interval_ms, 1, 60_000)?;
        check_range("final_drain_timeout_ms", self.recording.final_drain_timeout_ms, 0, 60_000)?;

        if self.recording.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than 0"));
        }

        check_range("fix_timeout_ms", self.positioning.fix_timeout_ms, 1, 60_000)?;

        if self.storage.enabled {
            if self.storage.bucket.is_empty() {
                return Err(invalid("storage bucket cannot be empty when enabled"));
            }
            if self.storage.device_id.is_empty() {
                return Err(invalid("storage device_id cannot be empty when enabled"));
            }
            if !self.recording.enabled {
                return Err(invalid("storage requires recording to be enabled"));
            }
        }

        check_range("probe_interval_ms", self.storage.probe_interval_ms, 1, 600_000)?;
        check_range("probe_timeout_ms", self.storage.probe_timeout_ms, 1, 60_000)?;

        if self.storage.probe_warn_every == 0 {
            return Err(invalid("probe_warn_every must be greater than 0"));
        }

        if self.notification.enabled {
            if self.notification.base_url.is_empty() {
                return Err(invalid("notification base_url cannot be empty when enabled"));
            }
            if self.notification.secret_header.is_empty() {
                return Err(invalid("notification secret_header cannot be empty when enabled"));
            }
            if !self.storage.enabled {
                return Err(invalid("notification requires storage to be enabled"));
            }
        }

        check_range("retry_initial_ms", self.notification.retry_initial_ms, 1, 600_000)?;
        check_range("retry_max_delay_ms", self.notification.retry_max_delay_ms, 1, 3_600_000)?;

        if self.notification.retry_multiplier < 1.0 || self.notification.retry_multiplier > 10.0 {
            return Err(invalid("retry_multiplier must be between 1.0 and 10.0"));
        }

        if self.notification.retry_max_attempts == 0 {
            return Err(invalid("retry_max_attempts must be greater than 0"));
        }

        if self.server.enabled && self.server.secret.is_empty() {
            return Err(invalid("server secret cannot be empty when the command server is enabled"));
        }

        Ok(())
    }
}

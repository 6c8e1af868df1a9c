//! # ELM327 Adapter
//!
//! `DiagnosticDevice` implementation for ELM327-compatible adapters.
//!
//! The adapter speaks a text protocol: each request is an AT command or an
//! OBD request in hex (`010C`), terminated by `\r`; each answer ends with the
//! `>` prompt. Values are reported as the data bytes of the vehicle's
//! response in hex, without unit decoding.
//!
//! Watched parameters are refreshed by a polling task into a value cache so
//! that sampling never waits on the serial link.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{DeviceFactory, DeviceStatus, DiagnosticDevice};
use crate::catalog::{Parameter, CLEAR_DTC_CODE, GET_DTC_CODE};
use crate::config::DeviceConfig;
use crate::error::{CollectorError, Result};
use crate::serial::port_trait::SerialPortIO;

/// Commands sent after opening the port: reset, echo off, linefeeds off,
/// spaces on, automatic protocol
const INIT_SEQUENCE: &[&str] = &["ATZ", "ATE0", "ATL0", "ATS1", "ATSP0"];

/// Responses that carry no vehicle data
const NO_DATA_MARKERS: &[&str] = &[
    "NO DATA",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS INIT",
    "BUS ERROR",
    "STOPPED",
    "ERROR",
    "?",
];

/// Opens the raw port for a device path and baud rate
pub type PortOpener = Arc<dyn Fn(&str, u32) -> Result<Box<dyn SerialPortIO>> + Send + Sync>;

/// An open, initialized serial link to the adapter
pub struct Elm327Link {
    port: Box<dyn SerialPortIO>,
}

impl Elm327Link {
    /// Send one command and collect the answer up to the prompt
    ///
    /// # Errors
    ///
    /// - `Serial` if the port fails
    /// - `Device` if no prompt arrives within `timeout`
    pub async fn command(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.port
            .write_all(format!("{}\r", command).as_bytes())
            .await
            .map_err(|e| CollectorError::Serial(format!("Failed to write {}: {}", command, e)))?;
        self.port
            .flush()
            .await
            .map_err(|e| CollectorError::Serial(format!("Failed to flush serial port: {}", e)))?;

        let mut response = Vec::new();
        let port = &mut self.port;
        let read = async {
            let mut buf = [0u8; 64];
            loop {
                let n = port.read(&mut buf).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "adapter closed the link",
                    ));
                }
                response.extend_from_slice(&buf[..n]);
                if response.contains(&b'>') {
                    return Ok(());
                }
            }
        };

        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| CollectorError::Device(format!("No answer to {} within {:?}", command, timeout)))?
            .map_err(|e| CollectorError::Serial(format!("Failed to read answer to {}: {}", command, e)))?;

        let text = clean_response(&String::from_utf8_lossy(&response));
        debug!("ELM327 {} -> {:?}", command, text);
        Ok(text)
    }
}

/// Strip the prompt, blank lines and protocol search notices
fn clean_response(raw: &str) -> String {
    raw.replace('>', "")
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("SEARCHING"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn hex_bytes(line: &str) -> Option<Vec<u8>> {
    let digits = line
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_digit(16).map(|d| d as u8))
        .collect::<Option<Vec<u8>>>()?;
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    Some(digits.chunks_exact(2).map(|pair| pair[0] << 4 | pair[1]).collect())
}

/// Data bytes of the first line answering `mode`/`pid`
fn response_data(response: &str, mode: u8, pid: Option<u8>) -> Option<Vec<u8>> {
    if NO_DATA_MARKERS.iter().any(|m| response.contains(m)) {
        return None;
    }

    let header_len = if pid.is_some() { 2 } else { 1 };
    response.lines().filter_map(hex_bytes).find_map(|bytes| {
        if bytes.len() < header_len || bytes[0] != mode.wrapping_add(0x40) {
            return None;
        }
        if let Some(pid) = pid {
            if bytes[1] != pid {
                return None;
            }
        }
        Some(bytes[header_len..].to_vec())
    })
}

fn format_value(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parameter_value(response: &str, param: &Parameter) -> Option<String> {
    let mode = param.mode()?;
    response_data(response, mode, param.pid()).map(|bytes| format_value(&bytes))
}

/// Decode one two-byte trouble code (`P0133`, `U0100`, ...)
pub fn decode_dtc(a: u8, b: u8) -> String {
    let system = ['P', 'C', 'B', 'U'][(a >> 6) as usize];
    format!("{}{}{:X}{:02X}", system, (a >> 4) & 0x03, a & 0x0F, b)
}

/// Decode every trouble code in a mode 03 answer
///
/// CAN adapters prefix the code list with a count byte, which shows up as an
/// odd payload length.
pub fn decode_fault_codes(response: &str) -> Vec<String> {
    let mut codes = Vec::new();
    for bytes in response.lines().filter_map(hex_bytes) {
        if bytes.first() != Some(&0x43) {
            continue;
        }
        let mut payload = &bytes[1..];
        if payload.len() % 2 == 1 {
            payload = &payload[1..];
        }
        for pair in payload.chunks_exact(2) {
            if pair[0] == 0 && pair[1] == 0 {
                continue;
            }
            codes.push(decode_dtc(pair[0], pair[1]));
        }
    }
    codes
}

/// Mode 01 PIDs flagged in a supported-PID bitmap answer for `base`
fn bitmap_pids(base: u8, data: &[u8]) -> HashSet<u8> {
    let mut pids = HashSet::new();
    for (byte_index, byte) in data.iter().take(4).enumerate() {
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                let pid = base as u16 + (byte_index * 8 + bit) as u16 + 1;
                // 0x100 is the "next range supported" flag of the 0xE0 bitmap
                if let Ok(pid) = u8::try_from(pid) {
                    pids.insert(pid);
                }
            }
        }
    }
    pids
}

struct Poller {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// ELM327 diagnostic device
pub struct Elm327Device {
    baud_rate: u32,
    response_timeout: Duration,
    polling_interval: Duration,
    opener: PortOpener,
    link: Arc<Mutex<Option<Elm327Link>>>,
    supported_pids: Option<HashSet<u8>>,
    watched: Vec<Parameter>,
    cache: Arc<RwLock<HashMap<String, Option<String>>>>,
    poller: Option<Poller>,
}

impl Elm327Device {
    pub fn new(config: &DeviceConfig, opener: PortOpener) -> Self {
        Self {
            baud_rate: config.baud_rate,
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            polling_interval: Duration::from_millis(config.polling_interval_ms),
            opener,
            link: Arc::new(Mutex::new(None)),
            supported_pids: None,
            watched: Vec::new(),
            cache: Arc::new(RwLock::new(HashMap::new())),
            poller: None,
        }
    }

    async fn send(&self, command: &str) -> Result<String> {
        let mut guard = self.link.lock().await;
        match guard.as_mut() {
            Some(link) => link.command(command, self.response_timeout).await,
            None => Err(CollectorError::Device("adapter link is closed".to_string())),
        }
    }

    async fn load_supported_pids(&mut self) -> Option<&HashSet<u8>> {
        if self.supported_pids.is_none() {
            let mut pids = HashSet::new();
            let mut base: u8 = 0x00;
            loop {
                let data = match self.send(&format!("01{:02X}", base)).await {
                    Ok(response) => response_data(&response, 0x01, Some(base)),
                    Err(_) => None,
                };
                let data = match data {
                    Some(data) => data,
                    // no answer to the first bitmap: retry on the next call
                    None if base == 0 => return None,
                    None => break,
                };
                pids.extend(bitmap_pids(base, &data));
                match base.checked_add(0x20) {
                    Some(next) if pids.contains(&next) => base = next,
                    _ => break,
                }
            }
            debug!("ELM327 reports {} supported mode 01 PIDs", pids.len());
            self.supported_pids = Some(pids);
        }
        self.supported_pids.as_ref()
    }

    fn is_polling(&self) -> bool {
        self.poller
            .as_ref()
            .map(|p| p.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl DiagnosticDevice for Elm327Device {
    async fn connect(&mut self, path: &str) -> Result<()> {
        let port = (self.opener)(path, self.baud_rate)?;
        let mut link = Elm327Link { port };

        for command in INIT_SEQUENCE {
            link.command(command, self.response_timeout).await?;
        }

        info!("ELM327 initialized on {}", path);
        *self.link.lock().await = Some(link);
        self.supported_pids = None;
        Ok(())
    }

    async fn status(&mut self) -> DeviceStatus {
        if self.link.lock().await.is_none() {
            return DeviceStatus::NotConnected;
        }
        match self.send("0100").await {
            Ok(response) if response_data(&response, 0x01, Some(0x00)).is_some() => {
                DeviceStatus::CarConnected
            }
            Ok(_) => DeviceStatus::ElmConnected,
            Err(e) => {
                debug!("ELM327 status probe failed: {}", e);
                DeviceStatus::NotConnected
            }
        }
    }

    async fn supports(&mut self, param: &Parameter) -> bool {
        match (param.mode(), param.pid()) {
            (Some(0x01), Some(0x00)) => true,
            (Some(0x01), Some(pid)) => self
                .load_supported_pids()
                .await
                .map(|pids| pids.contains(&pid))
                .unwrap_or(false),
            (Some(_), _) => true,
            (None, _) => false,
        }
    }

    async fn query(&mut self, param: &Parameter, force: bool) -> Result<Option<String>> {
        if !force && !self.supports(param).await {
            return Ok(None);
        }

        if self.is_polling() && self.watched.iter().any(|w| w.name == param.name) {
            return Ok(self.cache.read().get(&param.name).cloned().flatten());
        }

        let response = self.send(&param.code).await?;
        Ok(parameter_value(&response, param))
    }

    async fn read_fault_codes(&mut self) -> Result<Vec<String>> {
        let response = self.send(GET_DTC_CODE).await?;
        Ok(decode_fault_codes(&response))
    }

    async fn clear_fault_codes(&mut self) -> Result<()> {
        let response = self.send(CLEAR_DTC_CODE).await?;
        if response_data(&response, 0x04, None).is_some() {
            Ok(())
        } else {
            Err(CollectorError::Device(format!("clear codes rejected: {}", response)))
        }
    }

    async fn watch(&mut self, param: &Parameter) {
        if !self.watched.iter().any(|w| w.name == param.name) {
            self.watched.push(param.clone());
        }
    }

    async fn start_polling(&mut self) -> Result<()> {
        if self.is_polling() {
            return Ok(());
        }
        if self.link.lock().await.is_none() {
            return Err(CollectorError::Device("cannot poll a closed adapter".to_string()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let link = self.link.clone();
        let cache = self.cache.clone();
        let watched = self.watched.clone();
        let timeout = self.response_timeout;
        let interval = self.polling_interval;

        let handle = tokio::spawn(async move {
            while flag.load(Ordering::SeqCst) {
                for param in &watched {
                    if !flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let value = {
                        let mut guard = link.lock().await;
                        match guard.as_mut() {
                            Some(l) => match l.command(&param.code, timeout).await {
                                Ok(response) => parameter_value(&response, param),
                                Err(e) => {
                                    warn!("Polling {} failed: {}", param.name, e);
                                    None
                                }
                            },
                            None => None,
                        }
                    };
                    cache.write().insert(param.name.clone(), value);
                }
                tokio::time::sleep(interval).await;
            }
        });

        info!("ELM327 polling {} parameters", self.watched.len());
        self.poller = Some(Poller { running, handle });
        Ok(())
    }

    async fn stop_polling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.running.store(false, Ordering::SeqCst);
            if let Err(e) = poller.handle.await {
                warn!("ELM327 polling task ended abnormally: {}", e);
            }
        }
    }

    async fn unwatch_all(&mut self) {
        self.watched.clear();
        self.cache.write().clear();
    }

    async fn close(&mut self) {
        self.stop_polling().await;
        if self.link.lock().await.take().is_some() {
            info!("ELM327 link closed");
        }
        self.supported_pids = None;
    }
}

/// Hands out ELM327 devices backed by real serial ports
pub struct Elm327Factory {
    config: DeviceConfig,
}

impl Elm327Factory {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }
}

impl DeviceFactory for Elm327Factory {
    fn create(&self) -> Box<dyn DiagnosticDevice> {
        let opener: PortOpener = Arc::new(crate::serial::open_configured);
        Box::new(Elm327Device::new(&self.config, opener))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::serial::port_trait::mocks::MockSerialPort;

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            response_timeout_ms: 200,
            polling_interval_ms: 10,
            ..DeviceConfig::default()
        }
    }

    fn device_with(port: &MockSerialPort) -> Elm327Device {
        let port = port.clone();
        let opener: PortOpener = Arc::new(move |_path: &str, _baud: u32| {
            Ok(Box::new(port.clone()) as Box<dyn SerialPortIO>)
        });
        Elm327Device::new(&test_config(), opener)
    }

    fn car_port() -> MockSerialPort {
        let port = MockSerialPort::new();
        port.respond("ATZ", "ELM327 v1.5");
        port.respond("0100", "SEARCHING...\r41 00 BE 1F A8 13");
        port.respond("010C", "41 0C 1A F8");
        port.respond("010D", "41 0D 32");
        port
    }

    #[test]
    fn test_clean_response_strips_noise() {
        assert_eq!(clean_response("SEARCHING...\r41 0C 1A F8\r\r>"), "41 0C 1A F8");
        assert_eq!(clean_response("\r\r>"), "");
    }

    #[test]
    fn test_response_data_matches_mode_and_pid() {
        assert_eq!(response_data("41 0C 1A F8", 0x01, Some(0x0C)), Some(vec![0x1A, 0xF8]));
        assert_eq!(response_data("41 0D 32", 0x01, Some(0x0C)), None);
        assert_eq!(response_data("NO DATA", 0x01, Some(0x0C)), None);
        assert_eq!(response_data("44", 0x04, None), Some(vec![]));
    }

    #[test]
    fn test_bitmap_pids() {
        let pids = bitmap_pids(0x00, &[0xBE, 0x1F, 0xA8, 0x13]);
        assert!(pids.contains(&0x01));
        assert!(!pids.contains(&0x02));
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x0D));
        assert!(!pids.contains(&0x0A));
        assert!(pids.contains(&0x20));
    }

    #[test]
    fn test_bitmap_pids_last_range_flag_dropped() {
        let pids = bitmap_pids(0xE0, &[0x80, 0x00, 0x00, 0x01]);
        assert_eq!(pids.len(), 1);
        assert!(pids.contains(&0xE1));
        assert!(!pids.contains(&0x00));
    }

    #[test]
    fn test_garbled_bytes_are_not_hex() {
        assert_eq!(hex_bytes("41 0C 1A F8"), Some(vec![0x41, 0x0C, 0x1A, 0xF8]));
        assert_eq!(hex_bytes("4\u{FFFD}"), None);
        assert_eq!(hex_bytes("\u{FFFD}1 0C"), None);
        assert!(decode_fault_codes("4\u{FFFD}").is_empty());
        assert_eq!(decode_fault_codes("43 01 33\n4\u{FFFD}"), vec!["P0133".to_string()]);
    }

    #[test]
    fn test_decode_dtc() {
        assert_eq!(decode_dtc(0x01, 0x33), "P0133");
        assert_eq!(decode_dtc(0x41, 0x23), "C0123");
        assert_eq!(decode_dtc(0xC1, 0x00), "U0100");
    }

    #[test]
    fn test_decode_fault_codes_legacy_and_can() {
        assert_eq!(decode_fault_codes("43 01 33 00 00 00 00"), vec!["P0133".to_string()]);
        assert_eq!(
            decode_fault_codes("43 02 01 33 03 00"),
            vec!["P0133".to_string(), "P0300".to_string()]
        );
        assert!(decode_fault_codes("NO DATA").is_empty());
    }

    #[tokio::test]
    async fn test_connect_sends_init_sequence() {
        let port = car_port();
        let mut device = device_with(&port);

        device.connect("/dev/ttyUSB0").await.unwrap();

        let written = port.get_written_commands();
        assert_eq!(&written[..INIT_SEQUENCE.len()], INIT_SEQUENCE);
        assert_eq!(device.status().await, DeviceStatus::CarConnected);
        assert!(device.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_fails_on_write_error() {
        let port = car_port();
        port.set_write_error(std::io::ErrorKind::BrokenPipe);
        let mut device = device_with(&port);

        assert!(matches!(
            device.connect("/dev/ttyUSB0").await,
            Err(CollectorError::Serial(_))
        ));
        assert_eq!(device.status().await, DeviceStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_status_without_vehicle() {
        let port = MockSerialPort::new();
        port.respond("0100", "UNABLE TO CONNECT");
        let mut device = device_with(&port);

        assert_eq!(device.status().await, DeviceStatus::NotConnected);
        device.connect("/dev/ttyUSB0").await.unwrap();
        assert_eq!(device.status().await, DeviceStatus::ElmConnected);
    }

    #[tokio::test]
    async fn test_garbled_status_answer() {
        let port = car_port();
        port.respond("0100", "4\u{FFFD}");
        let mut device = device_with(&port);
        device.connect("/dev/ttyUSB0").await.unwrap();

        assert_eq!(device.status().await, DeviceStatus::ElmConnected);
    }

    #[tokio::test]
    async fn test_silent_adapter_times_out() {
        let port = car_port();
        let mut device = device_with(&port);
        device.connect("/dev/ttyUSB0").await.unwrap();

        port.set_silent(true);
        assert_eq!(device.status().await, DeviceStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_supports_and_query() {
        let port = car_port();
        let mut device = device_with(&port);
        device.connect("/dev/ttyUSB0").await.unwrap();

        let catalog = Catalog::standard();
        let rpm = catalog.parameter("RPM").unwrap();
        let fuel_pressure = catalog.parameter("FUEL_PRESSURE").unwrap();

        assert!(device.supports(rpm).await);
        assert!(!device.supports(fuel_pressure).await);
        assert_eq!(device.query(rpm, false).await.unwrap(), Some("1A F8".to_string()));
        assert_eq!(device.query(fuel_pressure, false).await.unwrap(), None);
        assert_eq!(device.query(fuel_pressure, true).await.unwrap(), None);
        assert!(port.get_written_commands().contains(&"010A".to_string()));
    }

    #[tokio::test]
    async fn test_fault_codes() {
        let port = car_port();
        port.respond("03", "43 01 33 03 00 00 00");
        port.respond("04", "44");
        let mut device = device_with(&port);
        device.connect("/dev/ttyUSB0").await.unwrap();

        let codes = device.read_fault_codes().await.unwrap();
        assert_eq!(codes, vec!["P0133".to_string(), "P0300".to_string()]);
        assert!(device.clear_fault_codes().await.is_ok());
    }

    #[tokio::test]
    async fn test_clear_fault_codes_rejected() {
        let port = car_port();
        let mut device = device_with(&port);
        device.connect("/dev/ttyUSB0").await.unwrap();

        assert!(device.clear_fault_codes().await.is_err());
    }

    #[tokio::test]
    async fn test_polling_fills_cache() {
        let port = car_port();
        let mut device = device_with(&port);
        device.connect("/dev/ttyUSB0").await.unwrap();

        let catalog = Catalog::standard();
        let rpm = catalog.parameter("RPM").unwrap();
        let speed = catalog.parameter("SPEED").unwrap();
        device.watch(rpm).await;
        device.watch(speed).await;
        device.start_polling().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(device.query(speed, false).await.unwrap(), Some("32".to_string()));

        device.stop_polling().await;
        device.unwatch_all().await;
        device.close().await;
        assert_eq!(device.status().await, DeviceStatus::NotConnected);
    }

    #[tokio::test]
    async fn test_start_polling_requires_link() {
        let port = car_port();
        let mut device = device_with(&port);
        assert!(device.start_polling().await.is_err());
    }
}

//! # Acquisition Session
//!
//! Owns one diagnostic adapter connection for the lifetime of one trip.
//!
//! ```text
//! Disconnected -> Connecting -> Probing -> Watching -> Active -> Stopping -> Closed
//!                      |            |          |
//!                      +------------+----------+--> Failed
//! ```
//!
//! Connecting polls the adapter status within a bounded budget. Probing
//! keeps the catalog entries the vehicle supports. Watching subscribes them
//! and starts the adapter's polling engine. While active, the session samples
//! the watched values into the trip file and answers queries.

use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, Parameter};
use crate::config::{Config, Separator};
use crate::error::{CollectorError, Result};
use crate::obd::{DeviceStatus, DiagnosticDevice};
use crate::positioning::PositioningReader;
use crate::telemetry::{device_time, DurableWriter, GlobalLabel, RecordFormatter, WriterStats};

/// Lifecycle of an acquisition session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Probing,
    Watching,
    Active,
    Stopping,
    Closed,
    Failed,
}

impl SessionState {
    /// No further transition will happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Probing => "PROBING",
            SessionState::Watching => "WATCHING",
            SessionState::Active => "ACTIVE",
            SessionState::Stopping => "STOPPING",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        };
        f.write_str(text)
    }
}

/// Trip file settings, present only when recording is enabled
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub directory: PathBuf,
    pub extension: String,
    pub separator: Separator,
    pub queue_capacity: usize,
    pub drain_interval: Duration,
    pub final_drain_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub port: String,
    pub connect_attempts: u32,
    pub status_poll_interval: Duration,
    pub settle: Duration,
    pub reconnect_cooldown: Duration,
    pub sample_interval: Duration,
    pub car_id: String,
    pub recording: Option<RecordingSettings>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let recording = config.recording.enabled.then(|| RecordingSettings {
            directory: PathBuf::from(&config.recording.directory),
            extension: config.recording.extension.clone(),
            separator: config.recording.separator,
            queue_capacity: config.recording.queue_capacity,
            drain_interval: config.recording.drain_interval(),
            final_drain_timeout: config.recording.final_drain_timeout(),
        });

        Self {
            port: config.device.port.clone(),
            connect_attempts: config.device.connect_attempts,
            status_poll_interval: Duration::from_millis(config.device.status_poll_interval_ms),
            settle: Duration::from_millis(config.device.settle_ms),
            reconnect_cooldown: Duration::from_millis(config.device.reconnect_cooldown_ms),
            sample_interval: config.recording.sample_interval(),
            car_id: config.recording.car_id.clone(),
            recording,
        }
    }
}

/// File name of the trip file for `trip_id`
pub fn trip_file_name(trip_id: &str, extension: &str) -> String {
    format!("{}.{}", trip_id, extension)
}

/// Catalog entries the connected vehicle supports
#[derive(Debug, Clone, Default)]
struct ActiveSet {
    parameters: Vec<Parameter>,
    statuses: Vec<Parameter>,
}

struct Shared {
    running: AtomicBool,
    wake: Notify,
    state: watch::Sender<SessionState>,
    failure: Mutex<Option<String>>,
    device: tokio::sync::Mutex<Box<dyn DiagnosticDevice>>,
    active: RwLock<ActiveSet>,
    catalog: Catalog,
    writer: Mutex<Option<Arc<DurableWriter>>>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session {} -> {}", previous, state);
        }
    }

    /// Sleep that a stop request cuts short
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.wake.notified() => {}
        }
    }

    async fn fail(&self, err: CollectorError) {
        error!("Acquisition session failed: {}", err);
        self.device.lock().await.close().await;
        *self.failure.lock() = Some(err.to_string());
        self.set_state(SessionState::Failed);
    }

    /// Wait for the vehicle to answer
    ///
    /// Every status poll reporting `NotConnected` consumes one attempt. A
    /// dropped link is closed and reopened after the cooldown.
    ///
    /// Returns `Ok(false)` when stopped before the vehicle answered.
    async fn connect(&self, settings: &SessionSettings) -> Result<bool> {
        self.set_state(SessionState::Connecting);
        info!("Opening OBD connection on {}", settings.port);

        let mut device = self.device.lock().await;
        if let Err(e) = device.connect(&settings.port).await {
            warn!("Could not open {}: {}", settings.port, e);
        }
        drop(device);
        self.pause(settings.settle).await;

        let mut attempts = 0;
        loop {
            if !self.is_running() {
                return Ok(false);
            }

            let mut device = self.device.lock().await;
            let status = device.status().await;
            if status != DeviceStatus::NotConnected {
                info!("OBD adapter reports {}", status);
                return Ok(true);
            }

            attempts += 1;
            if attempts >= settings.connect_attempts {
                return Err(CollectorError::ConnectionExhausted { attempts });
            }
            info!("OBD not connected, retry {}/{}", attempts, settings.connect_attempts);
            drop(device);
            self.pause(settings.status_poll_interval).await;

            let mut device = self.device.lock().await;
            if !device.is_connected().await {
                debug!("OBD link dropped, reopening after {:?}", settings.reconnect_cooldown);
                device.close().await;
                drop(device);
                self.pause(settings.reconnect_cooldown).await;

                let mut device = self.device.lock().await;
                if let Err(e) = device.connect(&settings.port).await {
                    warn!("Could not reopen {}: {}", settings.port, e);
                }
                drop(device);
                self.pause(settings.settle).await;
            }
        }
    }

    /// Keep the statuses and parameters the vehicle supports, catalog order
    async fn probe(&self, catalog: &Catalog) -> Result<ActiveSet> {
        self.set_state(SessionState::Probing);
        let mut device = self.device.lock().await;

        let mut active = ActiveSet::default();
        for status in catalog.statuses() {
            if device.supports(status).await {
                active.statuses.push(status.clone());
            } else {
                let forced = device.query(status, true).await;
                info!("Unsupported OBD status {} (forced read: {:?})", status.name, forced);
            }
        }

        for param in catalog.parameters() {
            if device.supports(param).await {
                active.parameters.push(param.clone());
            } else {
                let forced = device.query(param, true).await;
                info!("Unsupported OBD command {} (forced read: {:?})", param.name, forced);
            }
        }

        if active.parameters.is_empty() {
            return Err(CollectorError::CapabilityEmpty);
        }
        Ok(active)
    }

    async fn watch(&self, active: &ActiveSet) -> Result<()> {
        self.set_state(SessionState::Watching);
        let mut device = self.device.lock().await;

        for param in active.parameters.iter().chain(active.statuses.iter()) {
            device.watch(param).await;
        }
        device.start_polling().await?;

        info!("Connected to ECU, monitoring {} parameters", active.parameters.len());
        Ok(())
    }

    async fn sample(&self, formatter: &RecordFormatter, positioning: &PositioningReader) -> String {
        let mut values = Vec::with_capacity(formatter.parameters().len());
        {
            let mut device = self.device.lock().await;
            for param in formatter.parameters() {
                let value = match device.query(param, false).await {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("Sampling {} failed: {}", param.name, e);
                        None
                    }
                };
                values.push(value);
            }
        }
        formatter.data(&device_time(), &values, positioning.latest().as_ref())
    }

    async fn teardown(&self) {
        self.set_state(SessionState::Stopping);
        {
            let mut device = self.device.lock().await;
            device.stop_polling().await;
            device.unwatch_all().await;
            device.close().await;
        }

        let writer = self.writer.lock().clone();
        if let Some(writer) = writer {
            writer.stop().await;
        }

        info!("OBD connection closed");
        self.set_state(SessionState::Closed);
    }
}

/// One trip's acquisition task and the handle to query it
pub struct AcquisitionSession {
    trip_id: String,
    trip_file: Option<PathBuf>,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AcquisitionSession {
    /// Spawn the session task
    ///
    /// The active set is computed from a private copy of `catalog`.
    pub fn start(
        settings: SessionSettings,
        trip_id: String,
        catalog: &Catalog,
        device: Box<dyn DiagnosticDevice>,
        positioning: Arc<PositioningReader>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            wake: Notify::new(),
            state,
            failure: Mutex::new(None),
            device: tokio::sync::Mutex::new(device),
            active: RwLock::new(ActiveSet::default()),
            catalog: catalog.clone(),
            writer: Mutex::new(None),
        });

        let trip_file = settings
            .recording
            .as_ref()
            .map(|rec| rec.directory.join(trip_file_name(&trip_id, &rec.extension)));

        let task = SessionTask {
            shared: shared.clone(),
            settings,
            trip_id: trip_id.clone(),
            trip_file: trip_file.clone(),
            catalog: catalog.clone(),
            positioning,
        };
        let handle = tokio::spawn(task.run());

        Self {
            trip_id,
            trip_file,
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn trip_id(&self) -> &str {
        &self.trip_id
    }

    /// Trip file path, `None` when recording is disabled
    pub fn trip_file(&self) -> Option<&PathBuf> {
        self.trip_file.as_ref()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Reason of the `Failed` state
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    /// Wait until the session is active or has ended
    pub async fn wait_started(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        let result = rx
            .wait_for(|s| *s == SessionState::Active || s.is_terminal())
            .await
            .map(|s| *s);
        result.unwrap_or(SessionState::Closed)
    }

    /// Names of the active parameters in catalog order
    pub fn active_parameters(&self) -> Vec<String> {
        self.shared
            .active
            .read()
            .parameters
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn active_statuses(&self) -> Vec<String> {
        self.shared
            .active
            .read()
            .statuses
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn writer_stats(&self) -> Option<WriterStats> {
        self.shared.writer.lock().as_ref().map(|w| w.stats())
    }

    fn ensure_active(&self) -> Result<()> {
        let state = self.state();
        if state == SessionState::Active && self.shared.is_running() {
            Ok(())
        } else {
            Err(CollectorError::QueryUnavailable(format!("session is {}", state)))
        }
    }

    /// Current value of an active parameter
    ///
    /// # Errors
    ///
    /// `QueryUnavailable` unless the session is active and `name` is in the
    /// active set
    pub async fn query_parameter(&self, name: &str) -> Result<Option<String>> {
        self.ensure_active()?;
        let param = self
            .shared
            .active
            .read()
            .parameters
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .ok_or_else(|| CollectorError::QueryUnavailable(name.to_string()))?;

        self.shared.device.lock().await.query(&param, false).await
    }

    /// Current value of a catalog status
    pub async fn query_status(&self, name: &str) -> Result<Option<String>> {
        self.ensure_active()?;
        let status = self
            .shared
            .catalog
            .status(name)
            .cloned()
            .ok_or_else(|| CollectorError::QueryUnavailable(name.to_string()))?;

        self.shared.device.lock().await.query(&status, false).await
    }

    pub async fn read_fault_codes(&self) -> Result<Vec<String>> {
        self.ensure_active()?;
        self.shared.device.lock().await.read_fault_codes().await
    }

    pub async fn clear_fault_codes(&self) -> Result<()> {
        self.ensure_active()?;
        self.shared.device.lock().await.clear_fault_codes().await
    }

    /// Stop sampling, release the adapter and close the trip file
    ///
    /// Returns once the session task has finished. Idempotent.
    pub async fn terminate(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        self.shared.wake.notify_one();

        if let Err(e) = handle.await {
            error!("Acquisition task for trip {} ended abnormally: {}", self.trip_id, e);
        }
    }
}

struct SessionTask {
    shared: Arc<Shared>,
    settings: SessionSettings,
    trip_id: String,
    trip_file: Option<PathBuf>,
    catalog: Catalog,
    positioning: Arc<PositioningReader>,
}

impl SessionTask {
    async fn run(self) {
        let shared = self.shared.clone();

        match shared.connect(&self.settings).await {
            Ok(true) => {}
            Ok(false) => {
                shared.device.lock().await.close().await;
                shared.set_state(SessionState::Closed);
                return;
            }
            Err(e) => return shared.fail(e).await,
        }

        let active = match shared.probe(&self.catalog).await {
            Ok(active) => active,
            Err(e) => return shared.fail(e).await,
        };
        *shared.active.write() = active.clone();

        if let Err(e) = shared.watch(&active).await {
            shared.device.lock().await.unwatch_all().await;
            return shared.fail(e).await;
        }

        let formatter = RecordFormatter::new(
            self.settings
                .recording
                .as_ref()
                .map(|r| r.separator)
                .unwrap_or_default()
                .as_str(),
            vec![
                GlobalLabel::new("CAR_ID", &self.settings.car_id),
                GlobalLabel::new("TRIP_ID", &self.trip_id),
            ],
            active.parameters,
            self.positioning.is_enabled(),
        );

        let writer = self.open_writer(&formatter).await;
        *shared.writer.lock() = writer.clone();

        shared.set_state(SessionState::Active);
        info!("Trip {} started", self.trip_id);

        while shared.is_running() {
            if let Some(writer) = &writer {
                let line = shared.sample(&formatter, &self.positioning).await;
                match writer.submit(line) {
                    Ok(()) | Err(CollectorError::WriteQueueSaturated { .. }) => {}
                    Err(e) => warn!("Could not queue record: {}", e),
                }
            }
            shared.pause(self.settings.sample_interval).await;
        }

        shared.teardown().await;
        info!("Trip {} ended", self.trip_id);
    }

    async fn open_writer(&self, formatter: &RecordFormatter) -> Option<Arc<DurableWriter>> {
        let recording = self.settings.recording.as_ref()?;
        let path = self.trip_file.as_ref()?;

        match DurableWriter::create(
            path,
            formatter.header(),
            recording.queue_capacity,
            recording.drain_interval,
            recording.final_drain_timeout,
        )
        .await
        {
            Ok(writer) => Some(Arc::new(writer)),
            Err(e) => {
                error!("Cannot record trip to {}: {}", path.display(), e);
                None
            }
        }
    }
}

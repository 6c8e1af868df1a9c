//! # Orchestrator
//!
//! Single entry point for lifecycle and query operations.
//!
//! Owns at most one acquisition session and one positioning reader. Restart
//! always joins the previous session before the next one opens the adapter,
//! so two sessions never share the device.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::error::{CollectorError, Result};
use crate::obd::DeviceFactory;
use crate::positioning::{Fix, FixSource, PositionLabel, PositioningReader};
use crate::session::{trip_file_name, AcquisitionSession, SessionSettings, SessionState};
use crate::sync::{SyncAgent, SyncReport};
use crate::telemetry::{device_time, WriterStats};

pub struct Orchestrator {
    settings: SessionSettings,
    catalog: Catalog,
    factory: Arc<dyn DeviceFactory>,
    sync: Option<Arc<SyncAgent>>,
    fix_source: Mutex<Option<(Box<dyn FixSource>, Duration)>>,
    positioning: RwLock<Arc<PositioningReader>>,
    session: RwLock<Option<Arc<AcquisitionSession>>>,
    last_trip_id: Mutex<Option<String>>,
    lifecycle: tokio::sync::Mutex<()>,
    background: Mutex<Vec<JoinHandle<SyncReport>>>,
}

impl Orchestrator {
    pub fn new(
        settings: SessionSettings,
        catalog: Catalog,
        factory: Arc<dyn DeviceFactory>,
        sync: Option<Arc<SyncAgent>>,
    ) -> Self {
        Self {
            settings,
            catalog,
            factory,
            sync,
            fix_source: Mutex::new(None),
            positioning: RwLock::new(Arc::new(PositioningReader::disabled())),
            session: RwLock::new(None),
            last_trip_id: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            background: Mutex::new(Vec::new()),
        }
    }

    /// Read fixes from `source` once started
    pub fn with_positioning(self, source: Box<dyn FixSource>, fix_timeout: Duration) -> Self {
        *self.fix_source.lock() = Some((source, fix_timeout));
        self
    }

    /// Start the positioning reader, then the first session
    pub async fn start(&self) -> String {
        let source = self.fix_source.lock().take();
        if let Some((source, fix_timeout)) = source {
            *self.positioning.write() = Arc::new(PositioningReader::start(source, fix_timeout));
        }
        self.restart_session(false).await
    }

    /// Replace the current session with a new trip
    ///
    /// With `sync`, the finished trips are uploaded before the new session
    /// opens the adapter. Returns the new trip id.
    pub async fn restart_session(&self, sync: bool) -> String {
        let _lifecycle = self.lifecycle.lock().await;

        self.stop_current().await;
        if sync {
            self.sync_now().await;
        }

        let trip_id = self.next_trip_id().await;
        info!("Starting acquisition session for trip {}", trip_id);

        let open_trip = self
            .settings
            .recording
            .as_ref()
            .map(|recording| trip_file_name(&trip_id, &recording.extension));
        if let Some(agent) = &self.sync {
            agent.set_open_trip(open_trip.clone());
        }

        let positioning = self.positioning.read().clone();
        let session = AcquisitionSession::start(
            self.settings.clone(),
            trip_id.clone(),
            &self.catalog,
            self.factory.create(),
            positioning,
        );
        *self.session.write() = Some(Arc::new(session));

        if let Some(open_trip) = open_trip {
            self.schedule_sync(open_trip);
        }

        trip_id
    }

    /// Stop the current session without starting another
    pub async fn stop_session(&self, sync: bool) {
        let _lifecycle = self.lifecycle.lock().await;

        self.stop_current().await;
        if sync {
            self.sync_now().await;
        }
    }

    /// Stop everything and wait for background sync passes
    ///
    /// Sync is cancelled before the lifecycle lock is taken, so a stop or
    /// restart blocked on an unreachable store gives way.
    pub async fn shutdown(&self) {
        if let Some(agent) = &self.sync {
            agent.cancel();
        }
        let positioning = self.positioning.read().clone();
        positioning.stop().await;

        let _lifecycle = self.lifecycle.lock().await;
        self.stop_current().await;

        let handles = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Sync pass ended abnormally: {}", e);
            }
        }
        info!("Orchestrator stopped");
    }

    async fn stop_current(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            info!("Stopping trip {}", session.trip_id());
            session.terminate().await;
        }
        if let Some(agent) = &self.sync {
            agent.set_open_trip(None);
        }
    }

    async fn sync_now(&self) -> Option<SyncReport> {
        let agent = self.sync.as_ref()?;
        let report = agent.run_pass(None).await;
        info!(
            "Sync on stop: {} uploaded, {} failed",
            report.uploaded.len(),
            report.failed.len()
        );
        Some(report)
    }

    fn schedule_sync(&self, open_trip: String) {
        let Some(agent) = self.sync.clone() else {
            return;
        };

        let mut background = self.background.lock();
        background.retain(|handle| !handle.is_finished());
        background.push(tokio::spawn(async move { agent.run_pass(Some(&open_trip)).await }));
    }

    // Trip ids are timestamps; never hand out the same one twice
    async fn next_trip_id(&self) -> String {
        loop {
            let candidate = device_time();
            {
                let mut last = self.last_trip_id.lock();
                if last.as_deref() != Some(candidate.as_str()) {
                    *last = Some(candidate.clone());
                    return candidate;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn current(&self) -> Result<Arc<AcquisitionSession>> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| CollectorError::QueryUnavailable("no acquisition session".to_string()))
    }

    pub async fn query_parameter(&self, name: &str) -> Result<Option<String>> {
        self.current()?.query_parameter(name).await
    }

    pub async fn query_status(&self, name: &str) -> Result<Option<String>> {
        self.current()?.query_status(name).await
    }

    pub async fn read_fault_codes(&self) -> Result<Vec<String>> {
        self.current()?.read_fault_codes().await
    }

    pub async fn clear_fault_codes(&self) -> Result<()> {
        let result = self.current()?.clear_fault_codes().await;
        if result.is_ok() {
            warn!("Diagnostic trouble codes cleared on request");
        }
        result
    }

    /// Active parameter names, empty without a session
    pub fn active_parameters(&self) -> Vec<String> {
        self.current()
            .map(|session| session.active_parameters())
            .unwrap_or_default()
    }

    pub fn position(&self) -> Option<Fix> {
        self.positioning.read().latest()
    }

    /// One fix field by name (`LATITUDE` or `GPS_LATITUDE`)
    pub fn position_label(&self, name: &str) -> Option<f64> {
        let label = PositionLabel::from_name(name)?;
        self.positioning.read().label(label)
    }

    pub fn session_state(&self) -> Option<SessionState> {
        self.current().ok().map(|session| session.state())
    }

    pub fn trip_id(&self) -> Option<String> {
        self.current().ok().map(|session| session.trip_id().to_string())
    }

    pub fn writer_stats(&self) -> Option<WriterStats> {
        self.current().ok().and_then(|session| session.writer_stats())
    }

    /// Wait until the current session is active or has ended
    pub async fn wait_session_started(&self) -> Option<SessionState> {
        let session = self.current().ok()?;
        Some(session.wait_started().await)
    }
}

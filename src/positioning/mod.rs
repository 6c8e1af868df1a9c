//! # Positioning Module
//!
//! Continuous reader of the GPS fix stream.
//!
//! This module handles:
//! - The shared latest `Fix` (single writer, many readers)
//! - The background loop pulling fixes from a `FixSource`
//! - Label lookup used by trip records and the command surface

pub mod gpsd;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Latest position sample; fields stay `None` until the first valid fix
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Fix {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub track: Option<f64>,
    pub speed: Option<f64>,
}

/// Position columns, in trip record order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionLabel {
    Latitude,
    Longitude,
    Altitude,
    Track,
    Speed,
}

impl PositionLabel {
    pub const ALL: [PositionLabel; 5] = [
        PositionLabel::Latitude,
        PositionLabel::Longitude,
        PositionLabel::Altitude,
        PositionLabel::Track,
        PositionLabel::Speed,
    ];

    /// Header cell
    pub fn header(&self) -> &'static str {
        match self {
            PositionLabel::Latitude => "GPS_LATITUDE",
            PositionLabel::Longitude => "GPS_LONGITUDE",
            PositionLabel::Altitude => "GPS_ALTITUDE",
            PositionLabel::Track => "GPS_TRACK",
            PositionLabel::Speed => "GPS_SPEED",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.header() == name || l.header().trim_start_matches("GPS_") == name)
    }
}

impl Fix {
    pub fn get(&self, label: PositionLabel) -> Option<f64> {
        match label {
            PositionLabel::Latitude => self.latitude,
            PositionLabel::Longitude => self.longitude,
            PositionLabel::Altitude => self.altitude,
            PositionLabel::Track => self.track,
            PositionLabel::Speed => self.speed,
        }
    }
}

/// Source of fix updates
#[async_trait]
pub trait FixSource: Send {
    /// Wait for the next report; `Ok(None)` for reports that carry no fix
    async fn next_fix(&mut self) -> Result<Option<Fix>>;

    /// Release the underlying stream
    async fn close(&mut self);
}

/// Background reader keeping the latest fix
pub struct PositioningReader {
    enabled: bool,
    fix: Arc<RwLock<Fix>>,
    received: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PositioningReader {
    /// Reader for deployments without a GPS: every label is `None`
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            fix: Arc::new(RwLock::new(Fix::default())),
            received: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the read loop over `source`
    ///
    /// `fix_timeout` bounds each wait so a stop request is noticed even when
    /// the receiver goes quiet.
    pub fn start(mut source: Box<dyn FixSource>, fix_timeout: Duration) -> Self {
        let fix = Arc::new(RwLock::new(Fix::default()));
        let received = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let shared_fix = fix.clone();
        let shared_received = received.clone();
        let flag = running.clone();

        let handle = tokio::spawn(async move {
            info!("Positioning reader started");
            while flag.load(Ordering::SeqCst) {
                match tokio::time::timeout(fix_timeout, source.next_fix()).await {
                    Ok(Ok(Some(update))) => {
                        *shared_fix.write() = update;
                        shared_received.store(true, Ordering::SeqCst);
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        warn!("Positioning stream error: {}", e);
                        tokio::time::sleep(fix_timeout).await;
                    }
                    Err(_) => debug!("No fix within {:?}", fix_timeout),
                }
            }
            source.close().await;
            info!("Positioning reader stopped");
        });

        Self {
            enabled: true,
            fix,
            received,
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Latest fix, `None` before the first fix or when disabled
    pub fn latest(&self) -> Option<Fix> {
        if self.enabled && self.received.load(Ordering::SeqCst) {
            Some(*self.fix.read())
        } else {
            None
        }
    }

    pub fn label(&self, label: PositionLabel) -> Option<f64> {
        self.latest().and_then(|fix| fix.get(label))
    }

    /// Stop the loop and wait for the stream to be released. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Positioning reader ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    /// Replays queued fixes, then stays silent
    pub struct ScriptedFixSource {
        pub fixes: VecDeque<Fix>,
        pub closed: Arc<AtomicU32>,
    }

    impl ScriptedFixSource {
        pub fn new(fixes: Vec<Fix>) -> (Self, Arc<AtomicU32>) {
            let closed = Arc::new(AtomicU32::new(0));
            (
                Self {
                    fixes: fixes.into(),
                    closed: closed.clone(),
                },
                closed,
            )
        }
    }

    #[async_trait]
    impl FixSource for ScriptedFixSource {
        async fn next_fix(&mut self) -> Result<Option<Fix>> {
            match self.fixes.pop_front() {
                Some(fix) => Ok(Some(fix)),
                None => {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
            }
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

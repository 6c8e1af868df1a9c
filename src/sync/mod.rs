//! # Sync Module
//!
//! Moves completed trip files from local storage to the remote object store.
//!
//! A pass:
//! 1. waits until the remote endpoint answers
//! 2. lists trip files, skipping the trip still being written
//! 3. uploads each file, deleting the local copy on success
//! 4. notifies the downstream collector for every uploaded object
//!
//! Passes are serialized, so a pass triggered by a stop and one triggered by
//! the next session never upload the same file twice.

pub mod notifier;
pub mod reachability;
pub mod uploader;

pub use notifier::{deliver, HttpNotifier, Notifier, RetryPolicy, UploadNotice};
pub use reachability::{ReachabilityProbe, TcpProbe};
pub use uploader::{ObjectUploader, StoreUploader};

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;

/// Static parameters of the sync agent
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub directory: PathBuf,
    pub extension: String,
    pub root: String,
    pub device_id: String,
    pub probe_interval: Duration,
    pub warn_every: u64,
    pub retry: RetryPolicy,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            directory: PathBuf::from(&config.recording.directory),
            extension: config.recording.extension.clone(),
            root: config.storage.root.clone(),
            device_id: config.storage.device_id.clone(),
            probe_interval: Duration::from_millis(config.storage.probe_interval_ms),
            warn_every: config.storage.probe_warn_every.max(1),
            retry: RetryPolicy::from_config(&config.notification),
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Remote keys of uploaded files
    pub uploaded: Vec<String>,
    /// Local files that failed to upload
    pub failed: Vec<PathBuf>,
    pub notified: usize,
    pub notify_failed: usize,
    pub probe_attempts: u64,
    pub cancelled: bool,
}

pub struct SyncAgent {
    settings: SyncSettings,
    uploader: Arc<dyn ObjectUploader>,
    probe: Arc<dyn ReachabilityProbe>,
    notifier: Option<Arc<dyn Notifier>>,
    running: Arc<AtomicBool>,
    wake: Notify,
    open_trip: RwLock<Option<String>>,
    probe_warnings: AtomicU64,
    pass_lock: Mutex<()>,
}

impl SyncAgent {
    pub fn new(
        settings: SyncSettings,
        uploader: Arc<dyn ObjectUploader>,
        probe: Arc<dyn ReachabilityProbe>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            settings,
            uploader,
            probe,
            notifier,
            running: Arc::new(AtomicBool::new(true)),
            wake: Notify::new(),
            open_trip: RwLock::new(None),
            probe_warnings: AtomicU64::new(0),
            pass_lock: Mutex::new(()),
        }
    }

    /// Production agent: S3 upload, TCP reachability, HTTP notifications
    ///
    /// # Errors
    ///
    /// Returns error if the store, probe or HTTP client cannot be built
    pub fn from_config(config: &Config) -> Result<Self> {
        let uploader = Arc::new(StoreUploader::s3(&config.storage)?);
        let probe = Arc::new(TcpProbe::for_endpoint(
            &config.storage.endpoint,
            Duration::from_millis(config.storage.probe_timeout_ms),
        )?);
        let notifier: Option<Arc<dyn Notifier>> = if config.notification.enabled {
            Some(Arc::new(HttpNotifier::new(&config.notification)?))
        } else {
            None
        };

        Ok(Self::new(SyncSettings::from_config(config), uploader, probe, notifier))
    }

    /// Remote key of a local trip file
    pub fn object_key(&self, filename: &str) -> String {
        let root = self.settings.root.trim_matches('/');
        if root.is_empty() {
            format!("{}/{}", self.settings.device_id, filename)
        } else {
            format!("{}/{}/{}", root, self.settings.device_id, filename)
        }
    }

    /// Trip file currently being written, never uploaded by any pass
    pub fn set_open_trip(&self, filename: Option<String>) {
        *self.open_trip.write() = filename;
    }

    /// Abort reachability waits and notification retries
    pub fn cancel(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    /// Warnings emitted by unreachable probes so far
    pub fn probe_warnings(&self) -> u64 {
        self.probe_warnings.load(Ordering::SeqCst)
    }

    /// Probe until the remote endpoint answers
    ///
    /// Returns the number of probes made, or `None` if cancelled first.
    pub async fn wait_until_reachable(&self) -> Option<u64> {
        let mut attempts = 0u64;

        loop {
            // registered before the flag check so a concurrent cancel is never missed
            let cancelled = self.wake.notified();
            tokio::pin!(cancelled);
            cancelled.as_mut().enable();

            if self.is_cancelled() {
                return None;
            }

            attempts += 1;
            if self.probe.is_reachable().await {
                debug!("Remote endpoint reachable after {} probes", attempts);
                return Some(attempts);
            }

            if attempts % self.settings.warn_every == 0 {
                self.probe_warnings.fetch_add(1, Ordering::SeqCst);
                warn!("Remote endpoint still unreachable after {} probes", attempts);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.probe_interval) => {}
                _ = &mut cancelled => {}
            }
        }
    }

    /// Trip files eligible for upload, sorted by name
    ///
    /// Skips `exclude` and the open trip file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the recording directory cannot be listed
    pub async fn candidates(&self, exclude: Option<&str>) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        if !self.settings.directory.exists() {
            return Ok(files);
        }

        let open_trip = self.open_trip.read().clone();
        let mut entries = tokio::fs::read_dir(&self.settings.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_file() {
                continue;
            }

            let matches_extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == self.settings.extension);
            let name = path.file_name().and_then(|n| n.to_str());

            let excluded = name == exclude || (name.is_some() && name == open_trip.as_deref());

            if matches_extension && name.is_some() && !excluded {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Run one sync pass
    ///
    /// `exclude` names the trip file still being written. Per-file failures
    /// are logged and reported, never returned as errors.
    pub async fn run_pass(&self, exclude: Option<&str>) -> SyncReport {
        let _pass = self.pass_lock.lock().await;
        let mut report = SyncReport::default();

        match self.wait_until_reachable().await {
            Some(attempts) => report.probe_attempts = attempts,
            None => {
                info!("Sync pass cancelled before the endpoint became reachable");
                report.cancelled = true;
                return report;
            }
        }

        let files = match self.candidates(exclude).await {
            Ok(files) => files,
            Err(e) => {
                error!("Failed to list trip files in {:?}: {}", self.settings.directory, e);
                return report;
            }
        };

        info!("Sync pass: {} trip file(s) to upload", files.len());

        for path in files {
            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let key = self.object_key(filename);

            match self.uploader.put_object(&key, &path).await {
                Ok(()) => {
                    info!("Uploaded {} to {}", filename, key);
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("Uploaded {} but could not delete it: {}", filename, e);
                    }
                    report.uploaded.push(key);
                }
                Err(e) => {
                    error!("Upload of {} failed: {}", filename, e);
                    report.failed.push(path.clone());
                }
            }
        }

        if let Some(notifier) = &self.notifier {
            let mut tasks = JoinSet::new();
            for key in &report.uploaded {
                let notifier = notifier.clone();
                let policy = self.settings.retry.clone();
                let running = self.running.clone();
                let notice = UploadNotice::now(key);
                tasks.spawn(async move { deliver(notifier.as_ref(), &notice, &policy, &running).await });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(_)) => report.notified += 1,
                    Ok(Err(e)) => {
                        error!("{}", e);
                        report.notify_failed += 1;
                    }
                    Err(e) => {
                        error!("Notification task panicked: {}", e);
                        report.notify_failed += 1;
                    }
                }
            }
        }

        report
    }
}

//! # Durable Writer
//!
//! Bounded queue between the sampling loop and the trip file.
//!
//! The producer never waits: when the queue is full the newest line is
//! dropped and counted. A drain task appends everything queued, in order,
//! once per drain interval. After the first successful data append the file
//! head is checked once against the expected header and rewritten if needed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CollectorError, Result};

/// Writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub lines_written: u64,
    pub lines_dropped: u64,
    pub header_rewritten: bool,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    dropped: AtomicU64,
    header_rewritten: AtomicBool,
}

/// Byte sink behind a trip file
#[cfg_attr(test, mockall::automock)]
#[async_trait]
trait AppendTarget: Send {
    /// Current length in bytes
    async fn size(&mut self) -> io::Result<u64>;

    async fn append_bytes(&mut self, data: &[u8]) -> io::Result<()>;

    async fn sync(&mut self) -> io::Result<()>;

    async fn truncate(&mut self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl AppendTarget for fs::File {
    async fn size(&mut self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn append_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await?;
        self.flush().await
    }

    async fn sync(&mut self) -> io::Result<()> {
        self.sync_data().await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await
    }
}

/// Drain-side state of one trip file
struct TripFile {
    path: PathBuf,
    header: String,
    header_checked: bool,
    pending: Vec<String>,
    max_pending: usize,
}

impl TripFile {
    async fn append(&mut self, counters: &Counters) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;
        self.commit(&mut file, counters).await?;

        if !self.header_checked {
            self.header_checked = true;
            if self.reconcile_header().await? {
                counters.header_rewritten.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// Append every pending line to `target`
    ///
    /// Lines count as written once the bytes are accepted. A failed write is
    /// truncated back to the previous length and retried on the next drain;
    /// if that truncate fails too the batch is dropped, since a retry would
    /// duplicate whatever part of it reached the file.
    async fn commit(&mut self, target: &mut dyn AppendTarget, counters: &Counters) -> Result<()> {
        let start = target.size().await?;
        let batch: String = self.pending.concat();

        if let Err(e) = target.append_bytes(batch.as_bytes()).await {
            if let Err(rollback) = target.truncate(start).await {
                let lost = self.pending.len() as u64;
                self.pending.clear();
                counters.dropped.fetch_add(lost, Ordering::SeqCst);
                error!(
                    "Could not undo partial append to {} ({}), {} lines lost",
                    self.path.display(),
                    rollback,
                    lost
                );
            }
            return Err(e.into());
        }

        let count = self.pending.len() as u64;
        self.pending.clear();
        counters.written.fetch_add(count, Ordering::SeqCst);
        debug!("Appended {} lines to {}", count, self.path.display());

        if let Err(e) = target.sync().await {
            warn!("Failed to sync {} to disk: {}", self.path.display(), e);
        }
        Ok(())
    }

    /// Make sure the file starts with the expected header. Returns whether
    /// the file was rewritten.
    async fn reconcile_header(&self) -> Result<bool> {
        let contents = fs::read_to_string(&self.path).await?;
        let expected = self.header.trim_end_matches('\n');
        if contents.lines().next() == Some(expected) {
            return Ok(false);
        }

        warn!(
            "Header of {} does not match the active parameters, rewriting",
            self.path.display()
        );
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".reconcile");
        let tmp = PathBuf::from(tmp_name);

        let mut rewritten = String::with_capacity(self.header.len() + contents.len());
        rewritten.push_str(&self.header);
        rewritten.push_str(&contents);
        fs::write(&tmp, rewritten.as_bytes()).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(true)
    }

    fn take_queued(&mut self, rx: &mut mpsc::Receiver<String>) {
        while let Ok(line) = rx.try_recv() {
            self.pending.push(line);
        }
        if self.pending.len() > self.max_pending {
            let excess = self.pending.len() - self.max_pending;
            warn!("{} unwritten lines discarded for {}", excess, self.path.display());
            self.pending.drain(..excess);
        }
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<String>, counters: &Counters) {
        self.take_queued(rx);
        if let Err(e) = self.append(counters).await {
            error!(
                "Failed to append {} lines to {}: {}",
                self.pending.len(),
                self.path.display(),
                e
            );
        }
    }
}

type DrainResult = (mpsc::Receiver<String>, TripFile);

/// Bounded queue plus background appender for one trip file
pub struct DurableWriter {
    path: PathBuf,
    capacity: usize,
    sender: mpsc::Sender<String>,
    running: Arc<AtomicBool>,
    wake: Arc<Notify>,
    counters: Arc<Counters>,
    final_drain_timeout: Duration,
    handle: Mutex<Option<JoinHandle<DrainResult>>>,
}

impl DurableWriter {
    /// Open (or create) the trip file and start the drain task
    ///
    /// A missing or empty file gets `header` right away. A file that already
    /// has content is left as is until the first drain reconciles it.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the directory or file cannot be created
    pub async fn create(
        path: &Path,
        header: String,
        capacity: usize,
        drain_interval: Duration,
        final_drain_timeout: Duration,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let existing_len = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if existing_len == 0 {
            let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(header.as_bytes()).await?;
            file.sync_data().await?;
        }

        let (sender, mut rx) = mpsc::channel(capacity);
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let mut trip_file = TripFile {
            path: path.to_path_buf(),
            header,
            header_checked: false,
            pending: Vec::new(),
            max_pending: capacity.saturating_mul(4),
        };

        let wake = Arc::new(Notify::new());
        let flag = running.clone();
        let task_wake = wake.clone();
        let task_counters = counters.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(drain_interval) => {}
                    _ = task_wake.notified() => {}
                }
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                trip_file.drain(&mut rx, &task_counters).await;
            }
            (rx, trip_file)
        });

        info!("Recording trip to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            capacity,
            sender,
            running,
            wake,
            counters,
            final_drain_timeout,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue one line without waiting
    ///
    /// # Errors
    ///
    /// - `WriteQueueSaturated` if the queue is full (the line is dropped)
    /// - `Io` if the writer was stopped
    pub fn submit(&self, line: String) -> Result<()> {
        match self.sender.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Write queue full ({} lines), dropping record ({} dropped so far)",
                    self.capacity, dropped
                );
                Err(CollectorError::WriteQueueSaturated { capacity: self.capacity })
            }
            Err(TrySendError::Closed(_)) => Err(CollectorError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "trip writer stopped",
            ))),
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            lines_written: self.counters.written.load(Ordering::SeqCst),
            lines_dropped: self.counters.dropped.load(Ordering::SeqCst),
            header_rewritten: self.counters.header_rewritten.load(Ordering::SeqCst),
        }
    }

    /// Stop the drain task, then flush what is still queued within the
    /// final drain timeout. Idempotent.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };
        self.wake.notify_one();

        match handle.await {
            Ok((mut rx, mut trip_file)) => {
                rx.close();
                let final_drain = trip_file.drain(&mut rx, &self.counters);
                if tokio::time::timeout(self.final_drain_timeout, final_drain).await.is_err() {
                    warn!(
                        "Final drain of {} timed out, queued lines lost",
                        self.path.display()
                    );
                }
                let stats = self.stats();
                info!(
                    "Closed {} ({} lines written, {} dropped)",
                    self.path.display(),
                    stats.lines_written,
                    stats.lines_dropped
                );
            }
            Err(e) => error!("Trip writer task for {} failed: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HEADER: &str = "DEVICE_TIME\tCAR_ID\tRPM\n";

    async fn writer_in(dir: &TempDir, capacity: usize, drain_ms: u64) -> DurableWriter {
        DurableWriter::create(
            &dir.path().join("trip.csv"),
            HEADER.to_string(),
            capacity,
            Duration::from_millis(drain_ms),
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_file_gets_header_and_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let writer = writer_in(&dir, 16, 10).await;

        for i in 0..5 {
            writer.submit(format!("t{}\tcar\t{}\n", i, i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        writer.stop().await;

        let contents = std::fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], HEADER.trim_end());
        assert_eq!(lines.len(), 6);
        for (i, line) in lines[1..].iter().enumerate() {
            assert!(line.starts_with(&format!("t{}\t", i)));
        }

        let stats = writer.stats();
        assert_eq!(stats.lines_written, 5);
        assert_eq!(stats.lines_dropped, 0);
        assert!(!stats.header_rewritten);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let dir = TempDir::new().unwrap();
        // long drain interval: nothing leaves the queue during the test
        let writer = writer_in(&dir, 2, 60_000).await;

        assert!(writer.submit("a\n".to_string()).is_ok());
        assert!(writer.submit("b\n".to_string()).is_ok());

        let started = std::time::Instant::now();
        let result = writer.submit("c\n".to_string());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(matches!(result, Err(CollectorError::WriteQueueSaturated { capacity: 2 })));
        assert_eq!(writer.stats().lines_dropped, 1);
    }

    #[tokio::test]
    async fn test_stop_flushes_queued_lines() {
        let dir = TempDir::new().unwrap();
        let writer = writer_in(&dir, 16, 60_000).await;

        writer.submit("late\tcar\t1\n".to_string()).unwrap();
        // the drain sleep is long: stop must not wait for it
        tokio::time::timeout(Duration::from_secs(5), writer.stop())
            .await
            .unwrap();

        let contents = std::fs::read_to_string(writer.path()).unwrap();
        assert!(contents.ends_with("late\tcar\t1\n"));
        assert_eq!(writer.stats().lines_written, 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_queue() {
        let dir = TempDir::new().unwrap();
        let writer = writer_in(&dir, 16, 10).await;

        writer.submit("x\tcar\t1\n".to_string()).unwrap();
        writer.stop().await;
        writer.stop().await;

        let contents = std::fs::read_to_string(writer.path()).unwrap();
        assert!(contents.contains("x\tcar\t1"));
        assert!(writer.submit("y\n".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_mismatched_header_is_reconciled_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trip.csv");
        std::fs::write(&path, "DEVICE_TIME\tCAR_ID\tSPEED\nold\tcar\t1\n").unwrap();

        let writer = DurableWriter::create(
            &path,
            HEADER.to_string(),
            16,
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        writer.submit("new\tcar\t2\n".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().next(), Some(HEADER.trim_end()));
        assert!(contents.contains("old\tcar\t1"));
        assert!(contents.contains("new\tcar\t2"));
        assert!(writer.stats().header_rewritten);

        // a later header change is not touched again
        let tampered = contents.replacen(HEADER.trim_end(), "TAMPERED", 1);
        std::fs::write(&path, tampered).unwrap();
        writer.submit("newer\tcar\t3\n".to_string()).unwrap();
        writer.stop().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().next(), Some("TAMPERED"));
        assert!(contents.contains("newer\tcar\t3"));
    }

    #[tokio::test]
    async fn test_matching_header_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let writer = writer_in(&dir, 16, 10).await;

        writer.submit("t\tcar\t1\n".to_string()).unwrap();
        writer.stop().await;

        assert!(!writer.stats().header_rewritten);
        let contents = std::fs::read_to_string(writer.path()).unwrap();
        assert_eq!(contents.matches("DEVICE_TIME").count(), 1);
    }

    fn trip_file(dir: &TempDir, lines: &[&str]) -> TripFile {
        TripFile {
            path: dir.path().join("trip.csv"),
            header: HEADER.to_string(),
            header_checked: true,
            pending: lines.iter().map(|l| l.to_string()).collect(),
            max_pending: 16,
        }
    }

    fn failed(what: &str) -> io::Error {
        io::Error::new(io::ErrorKind::Other, what.to_string())
    }

    #[tokio::test]
    async fn test_sync_failure_does_not_repeat_lines() {
        let dir = TempDir::new().unwrap();
        let mut trip = trip_file(&dir, &["a\n", "b\n"]);
        let counters = Counters::default();

        let mut target = MockAppendTarget::new();
        target.expect_size().returning(|| Ok(10));
        target
            .expect_append_bytes()
            .withf(|data| data.to_vec() == b"a\nb\n".to_vec())
            .times(1)
            .returning(|_| Ok(()));
        target.expect_sync().times(1).returning(|| Err(failed("fsync")));
        target.expect_truncate().never();

        assert!(trip.commit(&mut target, &counters).await.is_ok());
        assert!(trip.pending.is_empty());
        assert_eq!(counters.written.load(Ordering::SeqCst), 2);

        // the next drain has nothing to append again
        assert!(trip.append(&counters).await.is_ok());
        assert!(!trip.path.exists());
        assert_eq!(counters.written.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_write_is_rolled_back_and_retried() {
        let dir = TempDir::new().unwrap();
        let mut trip = trip_file(&dir, &["a\n", "b\n"]);
        let counters = Counters::default();

        let mut target = MockAppendTarget::new();
        target.expect_size().returning(|| Ok(10));
        target.expect_append_bytes().times(1).returning(|_| Err(failed("disk full")));
        target
            .expect_truncate()
            .with(mockall::predicate::eq(10))
            .times(1)
            .returning(|_| Ok(()));

        assert!(trip.commit(&mut target, &counters).await.is_err());
        assert_eq!(trip.pending.len(), 2);
        assert_eq!(counters.written.load(Ordering::SeqCst), 0);

        let mut retry = MockAppendTarget::new();
        retry.expect_size().returning(|| Ok(10));
        retry
            .expect_append_bytes()
            .withf(|data| data.to_vec() == b"a\nb\n".to_vec())
            .times(1)
            .returning(|_| Ok(()));
        retry.expect_sync().returning(|| Ok(()));

        assert!(trip.commit(&mut retry, &counters).await.is_ok());
        assert_eq!(counters.written.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_torn_write_drops_batch() {
        let dir = TempDir::new().unwrap();
        let mut trip = trip_file(&dir, &["a\n", "b\n", "c\n"]);
        let counters = Counters::default();

        let mut target = MockAppendTarget::new();
        target.expect_size().returning(|| Ok(10));
        target.expect_append_bytes().returning(|_| Err(failed("io error")));
        target.expect_truncate().returning(|_| Err(failed("read-only")));

        assert!(trip.commit(&mut target, &counters).await.is_err());
        assert!(trip.pending.is_empty());
        assert_eq!(counters.dropped.load(Ordering::SeqCst), 3);
        assert_eq!(counters.written.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_creates_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("trip.csv");
        let writer = DurableWriter::create(
            &path,
            HEADER.to_string(),
            4,
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        writer.stop().await;
        assert_eq!(std::fs::read_to_string(&path).unwrap(), HEADER);
    }
}

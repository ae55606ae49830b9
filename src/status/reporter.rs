//! Periodic status reporter

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{write_json_atomic, StatusSnapshot, StatusSources};

/// Destination for status snapshots. Writes may block; they run on the
/// blocking pool.
pub trait StatusWriter: Send + 'static {
    fn write(&mut self, snapshot: &StatusSnapshot) -> Result<()>;
}

/// Overwrites a JSON file on every tick
pub struct FileStatusWriter {
    path: PathBuf,
}

impl FileStatusWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatusWriter for FileStatusWriter {
    fn write(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
        write_json_atomic(&self.path, snapshot)
    }
}

pub struct StatusReporter<W: StatusWriter> {
    sources: StatusSources,
    writer: Arc<Mutex<W>>,
    interval: Duration,
    /// Consecutive failed writes, used to avoid repeating the same warning
    failures: u32,
}

impl<W: StatusWriter> StatusReporter<W> {
    pub fn new(sources: StatusSources, writer: W, interval: Duration) -> Self {
        Self {
            sources,
            writer: Arc::new(Mutex::new(writer)),
            interval,
            failures: 0,
        }
    }

    /// Take one snapshot and write it. Failures are logged, never returned.
    pub async fn report(&mut self) {
        let snapshot = self.sources.snapshot();
        let writer = Arc::clone(&self.writer);
        let result = tokio::task::spawn_blocking(move || {
            writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write(&snapshot)
        })
        .await
        .unwrap_or_else(|e| Err(anyhow!("status write task failed: {}", e)));

        match result {
            Ok(()) => {
                if self.failures > 0 {
                    info!("Status writes recovered after {} failures", self.failures);
                }
                self.failures = 0;
            }
            Err(e) => {
                self.failures += 1;
                if self.failures == 1 {
                    warn!("Failed to write status snapshot: {:#}", e);
                } else {
                    debug!("Status write failure #{}: {:#}", self.failures, e);
                }
            }
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Status reporter started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.report().await,
            }
        }

        // Final snapshot so the file reflects the stopped state
        self.report().await;
        info!("Status reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::{BufferHandle, MarkerIngest, RollingBuffer};
    use crate::recording::RecorderStatus;
    use crate::trigger::TriggerEvent;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    fn sources() -> StatusSources {
        let (_, trigger) = watch::channel(TriggerEvent::default());
        let (_, recorder) = watch::channel(RecorderStatus::default());
        StatusSources {
            buffer: BufferHandle::new(RollingBuffer::new(10.0, 4)),
            ingest: MarkerIngest::new("markers.txt").stats_handle(),
            telemetry: None,
            trigger,
            recorder,
        }
    }

    /// Fails the first `fail_first` writes, then records snapshots
    struct FlakyWriter {
        fail_first: u32,
        attempts: Arc<Mutex<u32>>,
        written: Arc<Mutex<Vec<StatusSnapshot>>>,
    }

    impl StatusWriter for FlakyWriter {
        fn write(&mut self, snapshot: &StatusSnapshot) -> Result<()> {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            if *attempts <= self.fail_first {
                anyhow::bail!("disk full");
            }
            self.written.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_write_failure_retried_next_tick() {
        let attempts = Arc::new(Mutex::new(0));
        let written = Arc::new(Mutex::new(Vec::new()));
        let writer = FlakyWriter {
            fail_first: 2,
            attempts: attempts.clone(),
            written: written.clone(),
        };
        let mut reporter = StatusReporter::new(sources(), writer, Duration::from_secs(1));

        reporter.report().await;
        reporter.report().await;
        assert!(written.lock().unwrap().is_empty());
        assert_eq!(reporter.failures, 2);

        reporter.report().await;
        assert_eq!(written.lock().unwrap().len(), 1);
        assert_eq!(reporter.failures, 0);
    }

    struct SlowWriter;

    impl StatusWriter for SlowWriter {
        fn write(&mut self, _snapshot: &StatusSnapshot) -> Result<()> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_write_leaves_runtime_free() {
        let mut reporter = StatusReporter::new(sources(), SlowWriter, Duration::from_secs(1));
        let task = tokio::spawn(async move { reporter.report().await });

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_writes_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let reporter =
            StatusReporter::new(sources(), FileStatusWriter::new(&path), Duration::from_secs(1));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(reporter.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        shutdown.cancel();
        task.await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["buffer_capacity"], 4);
        assert_eq!(json["recording_active"], false);
    }
}

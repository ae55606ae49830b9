//! Marker ingest
//!
//! Tails the append-only event log written by the capture process. Each
//! `poll()` reads whatever complete lines were appended since the previous
//! call, starting from a byte cursor, so a line is never processed twice.

use notify::{RecursiveMode, Watcher};
use serde::Serialize;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{parse_marker_line, BufferHandle, FrameMarkerEvent, MarkerLine};
use crate::trigger::TriggerEvent;

/// Upper bound on bytes consumed by a single poll
const MAX_READ_PER_POLL: u64 = 1024 * 1024;

/// Ingest counters exposed to the status reporter
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IngestStats {
    /// False while the event log does not exist
    pub source_available: bool,
    /// Markers accepted since startup
    pub markers_total: u64,
    /// Lines that could not be parsed
    pub malformed: u64,
    /// Markers dropped because their sequence or capture time went backwards
    pub out_of_order: u64,
    /// Frames missing between consecutive accepted markers
    pub sequence_gaps: u64,
    pub last_sequence: Option<u64>,
    pub last_capture_time: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestStatsHandle {
    inner: Arc<Mutex<IngestStats>>,
}

impl IngestStatsHandle {
    fn lock(&self) -> MutexGuard<'_, IngestStats> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> IngestStats {
        *self.lock()
    }

    pub fn markers_total(&self) -> u64 {
        self.lock().markers_total
    }
}

/// Cursor-based reader over the capture process's event log
pub struct MarkerIngest {
    path: PathBuf,
    offset: u64,
    /// Bytes of a line whose newline has not arrived yet
    pending: Vec<u8>,
    last_sequence: Option<u64>,
    last_capture_time: Option<f64>,
    /// Set when the log shrank; cleared by `take_restart`
    restarted: bool,
    stats: IngestStatsHandle,
}

impl MarkerIngest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            pending: Vec::new(),
            last_sequence: None,
            last_capture_time: None,
            restarted: false,
            stats: IngestStatsHandle::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn stats_handle(&self) -> IngestStatsHandle {
        self.stats.clone()
    }

    /// Read and parse any complete lines appended since the last call.
    ///
    /// Never blocks waiting for data. A missing log returns nothing and marks
    /// the source unavailable; malformed lines are counted and skipped.
    pub fn poll(&mut self) -> Vec<FrameMarkerEvent> {
        let chunk = match self.read_new_bytes() {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.set_available(false);
                return Vec::new();
            }
            Err(e) => {
                warn!("Failed to read event log {:?}: {}", self.path, e);
                return Vec::new();
            }
        };
        self.set_available(true);

        if chunk.is_empty() {
            return Vec::new();
        }
        self.pending.extend_from_slice(&chunk);

        let Some(last_newline) = self.pending.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };
        let remainder = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, remainder);

        let mut markers = Vec::new();
        let mut stats = self.stats.lock();
        for raw in complete.split(|&b| b == b'\n') {
            let parsed = match std::str::from_utf8(raw) {
                Ok(line) => parse_marker_line(line),
                Err(_) => MarkerLine::Malformed,
            };

            match parsed {
                MarkerLine::Marker(marker) => {
                    let went_back = self.last_sequence.is_some_and(|s| marker.sequence <= s)
                        || self.last_capture_time.is_some_and(|t| marker.capture_time < t);
                    if went_back {
                        stats.out_of_order += 1;
                        continue;
                    }
                    if let Some(last) = self.last_sequence {
                        stats.sequence_gaps += marker.sequence - last - 1;
                    }
                    self.last_sequence = Some(marker.sequence);
                    self.last_capture_time = Some(marker.capture_time);
                    stats.markers_total += 1;
                    stats.last_sequence = Some(marker.sequence);
                    stats.last_capture_time = Some(marker.capture_time);
                    markers.push(marker);
                }
                MarkerLine::Malformed => {
                    stats.malformed += 1;
                    debug!("Skipping malformed marker line in {:?}", self.path);
                }
                MarkerLine::Ignored => {}
            }
        }

        markers
    }

    fn read_new_bytes(&mut self) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();

        if len < self.offset {
            warn!(
                "Event log {:?} shrank from {} to {} bytes, reading from the start",
                self.path, self.offset, len
            );
            self.offset = 0;
            self.pending.clear();
            self.last_sequence = None;
            self.last_capture_time = None;
            self.restarted = true;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        file.take(MAX_READ_PER_POLL).read_to_end(&mut chunk)?;
        self.offset += chunk.len() as u64;
        Ok(chunk)
    }

    /// True once after the log was truncated and reading started over
    pub fn take_restart(&mut self) -> bool {
        std::mem::take(&mut self.restarted)
    }

    fn set_available(&self, available: bool) {
        let mut stats = self.stats.lock();
        if stats.source_available != available {
            if available {
                info!("Event log {:?} is available", self.path);
            } else {
                warn!("Event log {:?} not found, waiting for capture process", self.path);
            }
        }
        stats.source_available = available;
    }

    /// Poll loop: append every marker to the buffer and forward it to the
    /// telemetry broadcaster, sleeping between polls when nothing is new.
    ///
    /// Each forwarded marker is paired with the trigger current when it was
    /// read, so a later trigger never reaches a queued marker.
    pub async fn run(
        mut self,
        buffer: BufferHandle,
        trigger: watch::Receiver<TriggerEvent>,
        telemetry_tx: Option<mpsc::UnboundedSender<(FrameMarkerEvent, TriggerEvent)>>,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let wakeup = Arc::new(Notify::new());
        let _watcher = self.watch_for_changes(wakeup.clone());
        info!(
            "Marker ingest started on {:?} (poll interval {:?})",
            self.path, poll_interval
        );

        loop {
            let markers = self.poll();
            let got_data = !markers.is_empty();
            if self.take_restart() {
                buffer.reset();
            }

            for marker in markers {
                if let Err(e) = buffer.append(marker) {
                    debug!("Rolling buffer rejected marker: {}", e);
                }
                if let Some(tx) = telemetry_tx.as_ref() {
                    let tag = *trigger.borrow();
                    let _ = tx.send((marker, tag));
                }
            }

            if got_data {
                // More may already be waiting beyond the per-poll read cap
                tokio::task::yield_now().await;
                if shutdown.is_cancelled() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wakeup.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!("Marker ingest stopped at offset {}", self.offset);
    }

    /// Install a file watcher on the log's directory that wakes the poll loop
    /// early. Returns None when watching is not possible; interval polling
    /// still works without it.
    fn watch_for_changes(&self, wakeup: Arc<Notify>) -> Option<notify::RecommendedWatcher> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let handler = move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                wakeup.notify_one();
            }
        };

        let mut watcher = match notify::recommended_watcher(handler) {
            Ok(watcher) => watcher,
            Err(e) => {
                debug!("File watcher unavailable, using interval polling: {}", e);
                return None;
            }
        };
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            debug!("Cannot watch {:?}, using interval polling: {}", dir, e);
            return None;
        }
        Some(watcher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::RollingBuffer;
    use crate::trigger::TriggerKind;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn sequences(markers: &[FrameMarkerEvent]) -> Vec<u64> {
        markers.iter().map(|m| m.sequence).collect()
    }

    #[test]
    fn test_missing_source_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        let mut ingest = MarkerIngest::new(&path);

        assert!(ingest.poll().is_empty());
        assert!(!ingest.stats_handle().get().source_available);

        append(&path, "1 0.1\n");
        assert_eq!(sequences(&ingest.poll()), vec![1]);
        assert!(ingest.stats_handle().get().source_available);
    }

    #[test]
    fn test_cursor_never_reprocesses_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        let mut ingest = MarkerIngest::new(&path);

        append(&path, "1 0.1\n2 0.2\n");
        assert_eq!(sequences(&ingest.poll()), vec![1, 2]);
        assert!(ingest.poll().is_empty());

        append(&path, "3 0.3\n");
        assert_eq!(sequences(&ingest.poll()), vec![3]);
        assert_eq!(ingest.offset(), std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        let mut ingest = MarkerIngest::new(&path);

        append(&path, "1 0.1\n2 0.");
        assert_eq!(sequences(&ingest.poll()), vec![1]);

        append(&path, "25\n");
        let markers = ingest.poll();
        assert_eq!(markers, vec![FrameMarkerEvent::new(2, 0.25)]);
    }

    #[test]
    fn test_malformed_and_out_of_order_lines_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        let mut ingest = MarkerIngest::new(&path);

        append(&path, "# timecode format v2\n1 0.1\ngarbage\n4 0.4\n3 0.3\n5 0.5\n");
        assert_eq!(sequences(&ingest.poll()), vec![1, 4, 5]);

        let stats = ingest.stats_handle().get();
        assert_eq!(stats.markers_total, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.sequence_gaps, 2);
        assert_eq!(stats.last_sequence, Some(5));
    }

    #[test]
    fn test_truncated_log_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        let mut ingest = MarkerIngest::new(&path);

        append(&path, "1 0.1\n2 0.2\n3 0.3\n");
        assert_eq!(ingest.poll().len(), 3);

        std::fs::write(&path, "4 0.4\n").unwrap();
        assert_eq!(sequences(&ingest.poll()), vec![4]);
    }

    #[test]
    fn test_restarted_capture_counts_from_zero_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        let mut ingest = MarkerIngest::new(&path);

        append(&path, "100 10.0\n101 10.1\n102 10.2\n");
        assert_eq!(ingest.poll().len(), 3);
        assert!(!ingest.take_restart());

        std::fs::write(&path, "0 0.0\n1 0.1\n").unwrap();
        assert_eq!(sequences(&ingest.poll()), vec![0, 1]);
        assert!(ingest.take_restart());
        assert!(!ingest.take_restart());

        let stats = ingest.stats_handle().get();
        assert_eq!(stats.out_of_order, 0);
        assert_eq!(stats.last_sequence, Some(1));
    }

    #[test]
    fn test_capture_time_going_backwards_is_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        let mut ingest = MarkerIngest::new(&path);

        append(&path, "1 1.0\n2 0.5\n3 1.5\n");
        assert_eq!(sequences(&ingest.poll()), vec![1, 3]);

        let stats = ingest.stats_handle().get();
        assert_eq!(stats.markers_total, 2);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.last_capture_time, Some(1.5));
    }

    #[tokio::test]
    async fn test_run_feeds_buffer_and_telemetry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        append(&path, "1 0.1\n2 0.2\n3 0.3\n");

        let buffer = BufferHandle::new(RollingBuffer::new(10.0, 100));
        let (trigger_tx, trigger_rx) = watch::channel(TriggerEvent::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let ingest = MarkerIngest::new(&path);
        let task = tokio::spawn(ingest.run(
            buffer.clone(),
            trigger_rx,
            Some(tx),
            Duration::from_millis(5),
            shutdown.clone(),
        ));

        for expected in 1..=3 {
            let (marker, tag) = rx.recv().await.unwrap();
            assert_eq!(marker.sequence, expected);
            assert_eq!(tag.kind, TriggerKind::None);
        }

        let local = TriggerEvent::new(TriggerKind::Local, 50.0, None);
        trigger_tx.send_replace(local);
        append(&path, "4 0.4\n");
        let (marker, tag) = rx.recv().await.unwrap();
        assert_eq!(marker.sequence, 4);
        assert_eq!(tag, local);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(buffer.stats().occupancy, 4);
    }

    #[tokio::test]
    async fn test_run_clears_buffer_when_log_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        append(&path, "100 10.0\n101 10.1\n102 10.2\n");

        let buffer = BufferHandle::new(RollingBuffer::new(100.0, 100));
        let (_trigger_tx, trigger_rx) = watch::channel(TriggerEvent::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(MarkerIngest::new(&path).run(
            buffer.clone(),
            trigger_rx,
            Some(tx),
            Duration::from_millis(5),
            shutdown.clone(),
        ));
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        std::fs::write(&path, "0 0.0\n1 0.1\n").unwrap();
        assert_eq!(rx.recv().await.unwrap().0.sequence, 0);
        assert_eq!(rx.recv().await.unwrap().0.sequence, 1);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(sequences(&buffer.snapshot()), vec![0, 1]);
    }
}

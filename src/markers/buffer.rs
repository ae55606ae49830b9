//! Rolling pre-trigger buffer
//!
//! Holds the most recent markers, bounded both by count and by age. Age is
//! measured against the newest marker's capture timestamp so the window is
//! expressed entirely in the capture clock.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

use super::FrameMarkerEvent;

#[derive(Debug, Error, PartialEq)]
pub enum BufferError {
    #[error("marker {sequence} is not newer than buffer tail {tail_sequence}")]
    OutOfOrder { sequence: u64, tail_sequence: u64 },
}

/// Fixed-capacity, age-bounded FIFO of frame markers
#[derive(Debug)]
pub struct RollingBuffer {
    events: VecDeque<FrameMarkerEvent>,
    max_age_seconds: f64,
    max_count: usize,
}

/// Occupancy figures for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BufferStats {
    pub occupancy: usize,
    pub capacity: usize,
    pub max_age_seconds: f64,
    pub oldest_sequence: Option<u64>,
    pub newest_sequence: Option<u64>,
    /// Capture-clock span between oldest and newest marker
    pub span_seconds: f64,
}

impl RollingBuffer {
    pub fn new(max_age_seconds: f64, max_count: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_count.min(4096)),
            max_age_seconds,
            max_count,
        }
    }

    /// Insert at the tail, then evict from the head until both bounds hold
    pub fn append(&mut self, event: FrameMarkerEvent) -> Result<(), BufferError> {
        if let Some(tail) = self.events.back() {
            if event.sequence <= tail.sequence || event.capture_time < tail.capture_time {
                return Err(BufferError::OutOfOrder {
                    sequence: event.sequence,
                    tail_sequence: tail.sequence,
                });
            }
        }

        self.events.push_back(event);
        self.evict(event.capture_time);
        Ok(())
    }

    fn evict(&mut self, newest_time: f64) {
        while let Some(head) = self.events.front() {
            let too_old = newest_time - head.capture_time > self.max_age_seconds;
            if too_old || self.events.len() > self.max_count {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<FrameMarkerEvent> {
        self.events.iter().copied().collect()
    }

    /// Atomically write the current contents to `path`
    pub fn dump_to(&self, path: &Path) -> Result<usize> {
        let events = self.snapshot();
        write_dump(path, &events)?;
        Ok(events.len())
    }

    /// Drop every marker, e.g. when the capture process starts over
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_count
    }

    pub fn stats(&self) -> BufferStats {
        let oldest = self.events.front();
        let newest = self.events.back();
        BufferStats {
            occupancy: self.events.len(),
            capacity: self.max_count,
            max_age_seconds: self.max_age_seconds,
            oldest_sequence: oldest.map(|e| e.sequence),
            newest_sequence: newest.map(|e| e.sequence),
            span_seconds: match (oldest, newest) {
                (Some(o), Some(n)) => n.capture_time - o.capture_time,
                _ => 0.0,
            },
        }
    }
}

/// Write markers as `sequence capture_time` lines to `path`.
///
/// The lines go to a temporary file in the destination directory which is
/// renamed over `path` only once fully written; on failure the temporary
/// file is removed and `path` is left untouched.
pub fn write_dump(path: &Path, events: &[FrameMarkerEvent]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create dump directory: {:?}", dir))?;

    let tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary dump file in {:?}", dir))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        for event in events {
            writeln!(writer, "{}", event.to_line())?;
        }
        writer.flush().context("Failed to flush buffer dump")?;
    }
    tmp.as_file()
        .sync_all()
        .context("Failed to sync buffer dump")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move buffer dump into place: {:?}", path))?;

    debug!("Dumped {} markers to {:?}", events.len(), path);
    Ok(())
}

/// Shared handle to the rolling buffer.
///
/// Marker ingest is the only writer; every other user copies out a snapshot
/// and releases the lock before doing anything slow.
#[derive(Debug, Clone)]
pub struct BufferHandle {
    inner: Arc<Mutex<RollingBuffer>>,
}

impl BufferHandle {
    pub fn new(buffer: RollingBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RollingBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, event: FrameMarkerEvent) -> Result<(), BufferError> {
        self.lock().append(event)
    }

    pub fn snapshot(&self) -> Vec<FrameMarkerEvent> {
        self.lock().snapshot()
    }

    pub fn stats(&self) -> BufferStats {
        self.lock().stats()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Snapshot under the lock, write after releasing it
    pub fn dump_to(&self, path: &Path) -> Result<usize> {
        let events = self.snapshot();
        write_dump(path, &events)?;
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequences(events: &[FrameMarkerEvent]) -> Vec<u64> {
        events.iter().map(|e| e.sequence).collect()
    }

    #[test]
    fn test_count_bound_keeps_newest() {
        let mut buffer = RollingBuffer::new(1000.0, 5);
        for seq in 1..=10 {
            buffer.append(FrameMarkerEvent::new(seq, seq as f64 * 0.01)).unwrap();
        }
        assert_eq!(sequences(&buffer.snapshot()), vec![6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_age_bound_evicts_old_markers() {
        let mut buffer = RollingBuffer::new(1.0, 100);
        for seq in 0..50 {
            buffer.append(FrameMarkerEvent::new(seq, seq as f64 * 0.25)).unwrap();
        }
        let snapshot = buffer.snapshot();
        let newest = snapshot.last().unwrap().capture_time;
        assert!(snapshot.iter().all(|e| newest - e.capture_time <= 1.0));
        // exactly max_age old is still inside the window
        assert_eq!(sequences(&snapshot), vec![45, 46, 47, 48, 49]);
    }

    #[test]
    fn test_bounds_hold_for_irregular_appends() {
        let mut buffer = RollingBuffer::new(0.5, 7);
        let mut time = 0.0;
        for seq in 0..500u64 {
            time += if seq % 13 == 0 { 0.4 } else { 0.01 * (seq % 5) as f64 + 0.001 };
            buffer.append(FrameMarkerEvent::new(seq, time)).unwrap();

            let snapshot = buffer.snapshot();
            assert!(snapshot.len() <= 7);
            assert!(snapshot.iter().all(|e| time - e.capture_time <= 0.5));
            assert!(snapshot.windows(2).all(|w| w[0].capture_time < w[1].capture_time));
        }
    }

    #[test]
    fn test_out_of_order_rejected() {
        let mut buffer = RollingBuffer::new(10.0, 10);
        buffer.append(FrameMarkerEvent::new(5, 1.0)).unwrap();
        assert_eq!(
            buffer.append(FrameMarkerEvent::new(5, 1.1)),
            Err(BufferError::OutOfOrder {
                sequence: 5,
                tail_sequence: 5
            })
        );
        assert!(buffer.append(FrameMarkerEvent::new(6, 0.9)).is_err());
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_dump_writes_lines_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pretrigger.txt");
        let handle = BufferHandle::new(RollingBuffer::new(10.0, 3));
        for seq in 1..=4 {
            handle.append(FrameMarkerEvent::new(seq, seq as f64 * 0.5)).unwrap();
        }

        assert_eq!(handle.dump_to(&path).unwrap(), 3);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "2 1\n3 1.5\n4 2\n");

        // Only the final file remains in the directory
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_failed_dump_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        // Destination is an existing directory, so the final rename fails
        let target = dir.path().join("occupied");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("keep"), b"x").unwrap();

        let buffer = RollingBuffer::new(10.0, 3);
        assert!(buffer.dump_to(&target).is_err());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_stats() {
        let mut buffer = RollingBuffer::new(10.0, 4);
        assert_eq!(buffer.stats().occupancy, 0);
        buffer.append(FrameMarkerEvent::new(1, 2.0)).unwrap();
        buffer.append(FrameMarkerEvent::new(2, 2.5)).unwrap();
        let stats = buffer.stats();
        assert_eq!(stats.occupancy, 2);
        assert_eq!(stats.capacity, 4);
        assert_eq!(stats.oldest_sequence, Some(1));
        assert_eq!(stats.newest_sequence, Some(2));
        assert!((stats.span_seconds - 0.5).abs() < 1e-9);
    }
}

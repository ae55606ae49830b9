//! Frame marker pipeline
//!
//! Markers are the `<index> <timestamp>` pairs the external capture process
//! appends to its event log, one per physical frame. This module tails that
//! log and keeps a bounded look-back window of the most recent markers so
//! that a recording can be preceded by its pre-trigger history.

mod buffer;
mod ingest;

pub use buffer::{write_dump, BufferError, BufferHandle, BufferStats, RollingBuffer};
pub use ingest::{IngestStats, IngestStatsHandle, MarkerIngest};

use serde::{Deserialize, Serialize};

/// A single frame's index and capture timestamp
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMarkerEvent {
    /// Monotonic frame index assigned by the capture process
    pub sequence: u64,
    /// Capture timestamp in seconds (capture clock)
    pub capture_time: f64,
}

impl FrameMarkerEvent {
    pub fn new(sequence: u64, capture_time: f64) -> Self {
        Self {
            sequence,
            capture_time,
        }
    }

    /// Format as a dump line (`sequence capture_time`)
    pub fn to_line(&self) -> String {
        format!("{} {}", self.sequence, self.capture_time)
    }
}

/// Result of parsing one event log line
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MarkerLine {
    Marker(FrameMarkerEvent),
    /// Blank lines and `#` headers written by some capture tools
    Ignored,
    Malformed,
}

pub(crate) fn parse_marker_line(line: &str) -> MarkerLine {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return MarkerLine::Ignored;
    }

    let mut fields = line.split_whitespace();
    let (Some(index), Some(timestamp), None) = (fields.next(), fields.next(), fields.next())
    else {
        return MarkerLine::Malformed;
    };

    let Ok(sequence) = index.parse::<u64>() else {
        return MarkerLine::Malformed;
    };
    match timestamp.parse::<f64>() {
        Ok(capture_time) if capture_time.is_finite() => {
            MarkerLine::Marker(FrameMarkerEvent::new(sequence, capture_time))
        }
        _ => MarkerLine::Malformed,
    }
}

//! Status aggregation
//!
//! `StatusSources` bundles the read sides of every component. Each read is a
//! short copy-out (mutex snapshot or watch borrow), so building a snapshot
//! never holds up a producer.

mod reporter;

pub use reporter::{FileStatusWriter, StatusReporter, StatusWriter};

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use tokio::sync::watch;

use crate::clock::unix_now;
use crate::markers::{BufferHandle, BufferStats, IngestStats, IngestStatsHandle};
use crate::recording::{RecorderStatus, RecordingSession, SessionSummary};
use crate::telemetry::{TelemetryStats, TelemetryStatsHandle};
use crate::trigger::{TriggerEvent, TriggerKind};

/// Point-in-time view of the whole agent, written to the status file
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub updated_at: f64,
    pub buffer_occupancy: usize,
    pub buffer_capacity: usize,
    /// Measured telemetry rate; 0 when telemetry is disabled
    pub telemetry_rate_hz: f64,
    pub recording_active: bool,
    /// Current session with its live frame count
    pub recording: Option<RecordingSession>,
    pub last_trigger_kind: TriggerKind,
    pub last_trigger_time: f64,
    pub last_error: Option<String>,
    pub sessions_completed: u64,
    pub last_session: Option<SessionSummary>,
    pub buffer: BufferStats,
    pub ingest: IngestStats,
    pub telemetry: Option<TelemetryStats>,
}

#[derive(Clone)]
pub struct StatusSources {
    pub buffer: BufferHandle,
    pub ingest: IngestStatsHandle,
    /// None when telemetry is disabled
    pub telemetry: Option<TelemetryStatsHandle>,
    pub trigger: watch::Receiver<TriggerEvent>,
    pub recorder: watch::Receiver<RecorderStatus>,
}

impl StatusSources {
    pub fn snapshot(&self) -> StatusSnapshot {
        let buffer = self.buffer.stats();
        let ingest = self.ingest.get();
        let telemetry = self.telemetry.as_ref().map(|t| t.get());
        let trigger = *self.trigger.borrow();
        let recorder = self.recorder.borrow().clone();

        let recording = recorder.session.map(|mut session| {
            session.frame_count = session.frames_at(ingest.markers_total);
            session
        });

        StatusSnapshot {
            updated_at: unix_now(),
            buffer_occupancy: buffer.occupancy,
            buffer_capacity: buffer.capacity,
            telemetry_rate_hz: telemetry.as_ref().map(|t| t.rate_hz).unwrap_or(0.0),
            recording_active: recording.is_some(),
            recording,
            last_trigger_kind: trigger.kind,
            last_trigger_time: trigger.time,
            last_error: recorder.last_error,
            sessions_completed: recorder.sessions_completed,
            last_session: recorder.last_summary,
            buffer,
            ingest,
            telemetry,
        }
    }

    /// Reply to `status`
    pub fn status_line(&self) -> String {
        let snapshot = self.snapshot();
        let recording = match &snapshot.recording {
            Some(session) => {
                let elapsed = (snapshot.updated_at - session.started_at).max(0.0);
                format!(
                    "recording {} ({} frames, {:.1}s)",
                    session.id, session.frame_count, elapsed
                )
            }
            None => "idle".to_string(),
        };
        let mut line = format!(
            "{}; buffer {}/{}; telemetry {:.1} Hz; trigger {}",
            recording,
            snapshot.buffer_occupancy,
            snapshot.buffer_capacity,
            snapshot.telemetry_rate_hz,
            snapshot.last_trigger_kind.as_str()
        );
        if !snapshot.ingest.source_available {
            line.push_str("; event log unavailable");
        }
        if let Some(error) = &snapshot.last_error {
            line.push_str(&format!("; last error: {}", error));
        }
        line
    }

    /// Reply to `get_stats`
    pub fn stats_report(&self) -> String {
        let s = self.snapshot();
        let mut lines = Vec::new();

        lines.push(format!(
            "buffer: {}/{} markers, span {:.2}s (max age {:.1}s)",
            s.buffer.occupancy, s.buffer.capacity, s.buffer.span_seconds, s.buffer.max_age_seconds
        ));
        lines.push(format!(
            "ingest: {} markers, {} malformed, {} out of order, {} missing frames, source {}",
            s.ingest.markers_total,
            s.ingest.malformed,
            s.ingest.out_of_order,
            s.ingest.sequence_gaps,
            if s.ingest.source_available { "available" } else { "unavailable" }
        ));
        match &s.telemetry {
            Some(t) => lines.push(format!(
                "telemetry: {:.1} Hz, {} sent, {} dropped, {} reconnects, {}",
                t.rate_hz,
                t.sent,
                t.dropped,
                t.reconnect_attempts,
                if t.connected { "connected" } else { "disconnected" }
            )),
            None => lines.push("telemetry: disabled".to_string()),
        }
        match &s.recording {
            Some(session) => lines.push(format!(
                "recording: active {} -> {} ({} frames)",
                session.id,
                session.output_path.display(),
                session.frame_count
            )),
            None => lines.push(format!(
                "recording: idle, {} sessions completed",
                s.sessions_completed
            )),
        }
        if let Some(summary) = &s.last_session {
            lines.push(format!("last session: {}", summary.describe()));
        }
        lines.join("\n")
    }
}

/// Serialize `value` as pretty JSON and replace `path` atomically
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {:?}", dir))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
    serde_json::to_writer_pretty(&mut tmp, value).context("Failed to serialize JSON")?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

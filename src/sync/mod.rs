//! Engine orchestration - wires the components into independent workers

mod engine;

pub use engine::{Engine, EngineHandle, LocalCommander};

use crate::recording::{RecordingSession, SessionSummary};

/// Notifications broadcast by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RecordingStarted { session: RecordingSession },
    RecordingFinished { summary: SessionSummary },
    /// A start attempt failed; the recorder is back to Idle
    RecordingFailed { error: String },
}

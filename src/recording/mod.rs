//! Recording control
//!
//! Starts and stops the external encoder independently of marker ingest and
//! telemetry. Every start first dumps the rolling buffer so the pre-trigger
//! history of a recording is preserved next to it.

mod controller;
mod process;

pub use controller::{ControllerSettings, RecordingController, RecordingHandle, RecordingRequest};
pub use process::{
    EncoderCommand, ExternalProcess, ExternalRecorder, LaunchSpec, ProcessExit, Recorder,
    RecorderError, RecordingProcess,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::trigger::TriggerKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    #[default]
    Idle,
    Active,
}

/// One recording, from the Idle→Active transition until it is finalized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: String,
    pub state: RecordingState,
    pub output_path: PathBuf,
    /// Unix time the encoder was launched
    pub started_at: f64,
    /// Markers ingested while this session was active
    pub frame_count: u64,
    pub duration_limit: Option<f64>,
    pub trigger_kind: TriggerKind,
    /// Where the pre-trigger buffer was dumped, if the dump succeeded
    pub pretrigger_dump: Option<PathBuf>,
    pub pretrigger_markers: usize,
    /// Ingest marker total when the session started
    #[serde(skip)]
    pub marker_base: u64,
}

impl RecordingSession {
    pub fn is_active(&self) -> bool {
        self.state == RecordingState::Active
    }

    /// Frame count given the current ingest marker total
    pub fn frames_at(&self, markers_total: u64) -> u64 {
        markers_total.saturating_sub(self.marker_base)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Requested,
    DurationElapsed,
    /// The encoder exited on its own
    ProcessExited,
    Shutdown,
}

/// Final statistics of a finished session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: RecordingSession,
    pub elapsed_secs: f64,
    pub stop_reason: StopReason,
    pub exit_code: Option<i32>,
    pub file_size: Option<u64>,
}

impl SessionSummary {
    pub fn describe(&self) -> String {
        let size = match self.file_size {
            Some(bytes) => format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0)),
            None => "no file".to_string(),
        };
        format!(
            "recording finished ({:?}): {} frames in {:.1}s, {} -> {}",
            self.stop_reason,
            self.session.frame_count,
            self.elapsed_secs,
            size,
            self.session.output_path.display()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(RecordingSession),
    /// At most one session may be active; the request was a no-op
    AlreadyRecording(RecordingSession),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped(SessionSummary),
    NotRecording,
}

/// What the controller publishes for readers
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecorderStatus {
    pub session: Option<RecordingSession>,
    pub sessions_completed: u64,
    pub last_summary: Option<SessionSummary>,
    /// Most recent operator-visible failure
    pub last_error: Option<String>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime};

    #[derive(Debug, Clone)]
    pub(crate) struct LaunchRecord {
        pub spec: LaunchSpec,
        pub launched_at: SystemTime,
        /// Pre-trigger dump files present when the encoder was launched
        pub dumps_present: Vec<PathBuf>,
    }

    /// Stand-in encoder that never touches a real process
    #[derive(Clone, Default)]
    pub(crate) struct FakeRecorder {
        pub launches: Arc<Mutex<Vec<LaunchRecord>>>,
        pub terminations: Arc<Mutex<u32>>,
        /// Fail the spawn itself (missing binary)
        pub fail_spawn: bool,
        /// Exit code the process reports right after launch
        pub exit_on_start: Option<i32>,
        /// Shared with the most recent process to make it exit on demand
        pub exit_now: Arc<Mutex<Option<i32>>>,
        /// How long `terminate` blocks before the process is gone
        pub terminate_delay: Duration,
    }

    pub(crate) struct FakeProcess {
        exit: Arc<Mutex<Option<i32>>>,
        terminations: Arc<Mutex<u32>>,
        terminate_delay: Duration,
    }

    impl Recorder for FakeRecorder {
        type Process = FakeProcess;

        fn launch(&mut self, spec: &LaunchSpec) -> Result<FakeProcess, RecorderError> {
            if self.fail_spawn {
                return Err(RecorderError::Spawn {
                    program: "fake-encoder".to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }

            let dir = spec.output_path.parent().unwrap().to_path_buf();
            let dumps_present = std::fs::read_dir(&dir)
                .unwrap()
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.to_string_lossy().ends_with("_pretrigger.txt"))
                .collect();
            self.launches.lock().unwrap().push(LaunchRecord {
                spec: spec.clone(),
                launched_at: SystemTime::now(),
                dumps_present,
            });

            std::fs::write(&spec.output_path, b"video").unwrap();
            *self.exit_now.lock().unwrap() = self.exit_on_start;
            Ok(FakeProcess {
                exit: self.exit_now.clone(),
                terminations: self.terminations.clone(),
                terminate_delay: self.terminate_delay,
            })
        }
    }

    impl RecordingProcess for FakeProcess {
        fn id(&self) -> Option<u32> {
            Some(4242)
        }

        fn try_wait(&mut self) -> Result<Option<ProcessExit>, RecorderError> {
            Ok(self.exit.lock().unwrap().map(|code| ProcessExit { code: Some(code) }))
        }

        fn terminate(&mut self, _timeout: Duration) -> Result<ProcessExit, RecorderError> {
            std::thread::sleep(self.terminate_delay);
            *self.terminations.lock().unwrap() += 1;
            Ok(ProcessExit { code: Some(0) })
        }
    }
}

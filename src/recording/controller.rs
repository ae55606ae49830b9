//! Recording controller
//!
//! Owns the Idle/Active state machine. Requests arrive over a channel and
//! are handled one at a time, so a stop sent right after a start is simply
//! processed once the start has completed. Manual stop, duration expiry,
//! encoder exit and shutdown all finalize a session through `finish`.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    LaunchSpec, ProcessExit, Recorder, RecorderStatus, RecordingProcess, RecordingSession,
    RecordingState, SessionSummary, StartOutcome, StopOutcome, StopReason,
};
use crate::clock::unix_now;
use crate::markers::{BufferHandle, IngestStatsHandle};
use crate::status::write_json_atomic;
use crate::sync::EngineEvent;
use crate::trigger::TriggerEvent;

/// How often a live encoder is checked for an unexpected exit
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(250);
const STARTUP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub output_directory: PathBuf,
    /// File stem template; `{timestamp}` and `{session}` are substituted
    pub name_template: String,
    /// Output file extension
    pub container: String,
    /// An encoder that exits within this window counts as failed to start
    pub startup_grace: Duration,
    pub stop_timeout: Duration,
    pub write_sidecar: bool,
}

#[derive(Debug)]
pub enum RecordingRequest {
    Start {
        duration: Option<Duration>,
        trigger: TriggerEvent,
        reply: oneshot::Sender<StartOutcome>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
}

/// Cloneable sender side used by the trigger dispatcher
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    tx: mpsc::Sender<RecordingRequest>,
    status: watch::Receiver<RecorderStatus>,
}

impl RecordingHandle {
    pub async fn start(
        &self,
        duration: Option<Duration>,
        trigger: TriggerEvent,
    ) -> Result<StartOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecordingRequest::Start {
                duration,
                trigger,
                reply,
            })
            .await
            .map_err(|_| anyhow!("recording controller is not running"))?;
        rx.await
            .map_err(|_| anyhow!("recording controller dropped the request"))
    }

    pub async fn stop(&self) -> Result<StopOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecordingRequest::Stop { reply })
            .await
            .map_err(|_| anyhow!("recording controller is not running"))?;
        rx.await
            .map_err(|_| anyhow!("recording controller dropped the request"))
    }

    pub fn status(&self) -> RecorderStatus {
        self.status.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.status.borrow().session.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecorderStatus> {
        self.status.clone()
    }
}

struct ActiveRecording<P> {
    session: RecordingSession,
    process: P,
    started: Instant,
    deadline: Option<Instant>,
}

pub struct RecordingController<R: Recorder> {
    /// Shared with the blocking pool while an encoder is being launched
    recorder: Arc<Mutex<R>>,
    buffer: BufferHandle,
    ingest: IngestStatsHandle,
    settings: ControllerSettings,
    active: Option<ActiveRecording<R::Process>>,
    status: watch::Sender<RecorderStatus>,
    events: broadcast::Sender<EngineEvent>,
}

impl<R: Recorder> RecordingController<R> {
    pub fn new(
        recorder: R,
        buffer: BufferHandle,
        ingest: IngestStatsHandle,
        settings: ControllerSettings,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let (status, _) = watch::channel(RecorderStatus::default());
        Self {
            recorder: Arc::new(Mutex::new(recorder)),
            buffer,
            ingest,
            settings,
            active: None,
            status,
            events,
        }
    }

    /// Create the request channel and the handle that feeds it
    pub fn handle(&self) -> (RecordingHandle, mpsc::Receiver<RecordingRequest>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = RecordingHandle {
            tx,
            status: self.status.subscribe(),
        };
        (handle, rx)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    fn render_stem(&self, session_id: &str) -> String {
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
        let short_id = session_id.split('-').next().unwrap_or(session_id);
        self.settings
            .name_template
            .replace("{timestamp}", &timestamp)
            .replace("{session}", short_id)
    }

    /// Pick `<stem>.<container>`, adding a counter if that file already exists
    fn fresh_output_path(&self, stem: &str) -> (PathBuf, String) {
        let dir = &self.settings.output_directory;
        let mut candidate = stem.to_string();
        let mut n = 1;
        while dir
            .join(format!("{}.{}", candidate, self.settings.container))
            .exists()
        {
            candidate = format!("{}-{}", stem, n);
            n += 1;
        }
        (
            dir.join(format!("{}.{}", candidate, self.settings.container)),
            candidate,
        )
    }

    /// Idle→Active: dump the buffer, then launch the encoder
    pub async fn start(&mut self, duration: Option<Duration>, trigger: TriggerEvent) -> StartOutcome {
        if let Some(active) = self.active.as_ref() {
            warn!(
                "Recording already in progress ({}), ignoring start",
                active.session.id
            );
            return StartOutcome::AlreadyRecording(self.live_session(&active.session));
        }

        if let Err(e) = std::fs::create_dir_all(&self.settings.output_directory) {
            return self.fail(format!(
                "cannot create output directory {:?}: {}",
                self.settings.output_directory, e
            ));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let stem = self.render_stem(&session_id);
        let (output_path, stem) = self.fresh_output_path(&stem);

        // The dump must be complete before the encoder exists
        let dump_path = self
            .settings
            .output_directory
            .join(format!("{}_pretrigger.txt", stem));
        let (pretrigger_dump, pretrigger_markers) =
            Self::dump_buffer(self.buffer.clone(), dump_path).await;

        let marker_base = self.ingest.markers_total();
        let spec = LaunchSpec {
            output_path: output_path.clone(),
            duration,
        };
        let recorder = Arc::clone(&self.recorder);
        let launched = tokio::task::spawn_blocking(move || {
            recorder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .launch(&spec)
        })
        .await;
        let mut process = match launched {
            Ok(Ok(process)) => process,
            Ok(Err(e)) => return self.fail(format!("encoder failed to start: {}", e)),
            Err(e) => return self.fail(format!("encoder launch task failed: {}", e)),
        };

        if let Some(failure) = Self::await_startup(&mut process, self.settings.startup_grace).await {
            let cleanup =
                tokio::task::spawn_blocking(move || process.terminate(Duration::ZERO)).await;
            if let Ok(Err(e)) = cleanup {
                debug!("Cleanup after failed start: {}", e);
            }
            return self.fail(failure);
        }

        let started = Instant::now();
        let session = RecordingSession {
            id: session_id,
            state: RecordingState::Active,
            output_path,
            started_at: unix_now(),
            frame_count: 0,
            duration_limit: duration.map(|d| d.as_secs_f64()),
            trigger_kind: trigger.kind,
            pretrigger_dump,
            pretrigger_markers,
            marker_base,
        };

        info!(
            "Recording started: session={}, output={:?}, duration={:?}, pid={:?}",
            session.id,
            session.output_path,
            duration,
            process.id()
        );

        self.active = Some(ActiveRecording {
            session: session.clone(),
            process,
            started,
            deadline: duration.map(|d| started + d),
        });
        self.status.send_modify(|status| {
            status.session = Some(session.clone());
            status.last_error = None;
        });
        let _ = self.events.send(EngineEvent::RecordingStarted {
            session: session.clone(),
        });

        StartOutcome::Started(session)
    }

    async fn dump_buffer(buffer: BufferHandle, path: PathBuf) -> (Option<PathBuf>, usize) {
        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || buffer.dump_to(&target)).await;

        match result {
            Ok(Ok(count)) => {
                info!("Pre-trigger buffer dumped: {} markers to {:?}", count, path);
                (Some(path), count)
            }
            Ok(Err(e)) => {
                warn!("Pre-trigger buffer dump failed: {:#}", e);
                (None, 0)
            }
            Err(e) => {
                error!("Pre-trigger buffer dump task failed: {}", e);
                (None, 0)
            }
        }
    }

    /// Watch a fresh encoder through its startup window
    async fn await_startup(process: &mut R::Process, grace: Duration) -> Option<String> {
        let deadline = Instant::now() + grace;
        loop {
            match process.try_wait() {
                Ok(Some(exit)) => {
                    return Some(format!(
                        "encoder exited during startup ({})",
                        describe_exit(exit)
                    ))
                }
                Ok(None) => {}
                Err(e) => return Some(format!("cannot check encoder state: {}", e)),
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep(STARTUP_POLL.min(deadline - now)).await;
        }
    }

    fn fail(&mut self, message: String) -> StartOutcome {
        error!("Recording failed: {}", message);
        self.status.send_modify(|status| {
            status.session = None;
            status.last_error = Some(message.clone());
        });
        let _ = self.events.send(EngineEvent::RecordingFailed {
            error: message.clone(),
        });
        StartOutcome::Failed(message)
    }

    /// Active→Idle on request
    pub async fn stop(&mut self, reason: StopReason) -> StopOutcome {
        match self.active.take() {
            Some(active) => StopOutcome::Stopped(self.finish(active, reason, None).await),
            None => {
                debug!("No recording in progress");
                StopOutcome::NotRecording
            }
        }
    }

    /// The single finalization path for every way a session can end
    async fn finish(
        &mut self,
        active: ActiveRecording<R::Process>,
        reason: StopReason,
        exit: Option<ProcessExit>,
    ) -> SessionSummary {
        let ActiveRecording {
            mut session,
            mut process,
            started,
            ..
        } = active;
        info!("Stopping recording {} ({:?})", session.id, reason);

        // Idle from here on: a start arriving while the encoder winds down
        // is a fresh transition and queues behind this finish
        self.status.send_modify(|status| status.session = None);

        let exit = match exit {
            Some(exit) => Some(exit),
            None => {
                let timeout = self.settings.stop_timeout;
                let result =
                    tokio::task::spawn_blocking(move || process.terminate(timeout)).await;
                match result {
                    Ok(Ok(exit)) => Some(exit),
                    Ok(Err(e)) => {
                        warn!("Encoder did not terminate cleanly: {}", e);
                        None
                    }
                    Err(e) => {
                        error!("Encoder termination task failed: {}", e);
                        None
                    }
                }
            }
        };

        session.state = RecordingState::Idle;
        session.frame_count = session.frames_at(self.ingest.markers_total());
        let summary = SessionSummary {
            elapsed_secs: started.elapsed().as_secs_f64(),
            stop_reason: reason,
            exit_code: exit.and_then(|e| e.code),
            file_size: std::fs::metadata(&session.output_path).ok().map(|m| m.len()),
            session,
        };
        info!("{}", summary.describe());

        if self.settings.write_sidecar {
            let sidecar = sidecar_path(&summary.session.output_path);
            if let Err(e) = write_json_atomic(&sidecar, &summary) {
                warn!("Failed to write session sidecar {:?}: {:#}", sidecar, e);
            }
        }

        self.status.send_modify(|status| {
            status.sessions_completed += 1;
            status.last_summary = Some(summary.clone());
        });
        let _ = self.events.send(EngineEvent::RecordingFinished {
            summary: summary.clone(),
        });

        summary
    }

    /// Session with its frame count brought up to date
    fn live_session(&self, session: &RecordingSession) -> RecordingSession {
        let mut session = session.clone();
        session.frame_count = session.frames_at(self.ingest.markers_total());
        session
    }

    /// Finalize the session if the encoder exited on its own
    async fn check_process(&mut self) {
        let exit = match self.active.as_mut().map(|a| a.process.try_wait()) {
            Some(Ok(Some(exit))) => exit,
            Some(Err(e)) => {
                warn!("Cannot check encoder state: {}", e);
                return;
            }
            _ => return,
        };

        if let Some(active) = self.active.take() {
            warn!(
                "Encoder for session {} exited on its own ({})",
                active.session.id,
                describe_exit(exit)
            );
            self.finish(active, StopReason::ProcessExited, Some(exit)).await;
        }
    }

    async fn handle_request(&mut self, request: RecordingRequest) {
        match request {
            RecordingRequest::Start {
                duration,
                trigger,
                reply,
            } => {
                let outcome = self.start(duration, trigger).await;
                let _ = reply.send(outcome);
            }
            RecordingRequest::Stop { reply } => {
                let outcome = self.stop(StopReason::Requested).await;
                let _ = reply.send(outcome);
            }
        }
    }

    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<RecordingRequest>,
        shutdown: CancellationToken,
    ) {
        info!(
            "Recording controller ready (output directory {:?})",
            self.settings.output_directory
        );
        let mut exit_check = tokio::time::interval(EXIT_CHECK_INTERVAL);

        loop {
            let deadline = self.active.as_ref().and_then(|a| a.deadline);

            tokio::select! {
                _ = shutdown.cancelled() => break,

                request = requests.recv() => {
                    match request {
                        Some(request) => self.handle_request(request).await,
                        None => break,
                    }
                }

                // Duration limit reached
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    info!("Recording duration limit reached");
                    self.stop(StopReason::DurationElapsed).await;
                }

                _ = exit_check.tick() => self.check_process().await,
            }
        }

        if self.active.is_some() {
            info!("Shutdown with recording in progress, finalizing it");
            self.stop(StopReason::Shutdown).await;
        }
        info!("Recording controller stopped");
    }
}

fn sidecar_path(output: &Path) -> PathBuf {
    output.with_extension("json")
}

fn describe_exit(exit: ProcessExit) -> String {
    match exit.code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

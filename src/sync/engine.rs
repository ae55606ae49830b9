//! Engine
//!
//! Spawns one worker per component and hands back a handle for local
//! commands and shutdown. Workers share state only through the rolling
//! buffer, the trigger watch and the recorder status watch.

use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::unix_now;
use crate::config::Config;
use crate::markers::{BufferHandle, MarkerIngest, RollingBuffer};
use crate::recording::{ControllerSettings, Recorder, RecordingController};
use crate::status::{FileStatusWriter, StatusReporter, StatusSources};
use crate::telemetry::{SinkConnector, TelemetryBroadcaster};
use crate::trigger::{
    CommandReply, CommandSource, InboundCommand, RemoteChannel, TriggerDispatcher, TriggerEvent,
};

use super::EngineEvent;

/// Sends local commands; cheap to clone into other threads
#[derive(Debug, Clone)]
pub struct LocalCommander {
    tx: mpsc::Sender<InboundCommand>,
}

impl LocalCommander {
    pub async fn send(&self, text: &str) -> Result<CommandReply> {
        let (reply, rx) = oneshot::channel();
        let inbound =
            InboundCommand::new(CommandSource::Local, text, unix_now()).with_reply(reply);
        self.tx
            .send(inbound)
            .await
            .map_err(|_| anyhow!("engine is not running"))?;
        rx.await.map_err(|_| anyhow!("engine dropped the command"))
    }

    /// Synchronous variant for non-async callers such as the stdin reader.
    /// Must not be called from inside the runtime.
    pub fn send_blocking(&self, text: &str) -> Result<CommandReply> {
        let (reply, rx) = oneshot::channel();
        let inbound =
            InboundCommand::new(CommandSource::Local, text, unix_now()).with_reply(reply);
        self.tx
            .blocking_send(inbound)
            .map_err(|_| anyhow!("engine is not running"))?;
        rx.blocking_recv()
            .map_err(|_| anyhow!("engine dropped the command"))
    }
}

/// Components assembled from configuration, ready to be started
pub struct Engine<R: Recorder> {
    config: Config,
    recorder: R,
    /// None disables telemetry
    connector: Option<Box<dyn SinkConnector>>,
}

impl<R: Recorder> Engine<R> {
    pub fn new(config: Config, recorder: R, connector: Option<Box<dyn SinkConnector>>) -> Self {
        Self {
            config,
            recorder,
            connector,
        }
    }

    /// Spawn every worker on the current runtime
    pub fn start(self) -> Result<EngineHandle> {
        let Engine {
            config,
            recorder,
            connector,
        } = self;

        let shutdown = CancellationToken::new();
        let reporter_shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(64);
        let (trigger_tx, trigger_rx) = watch::channel(TriggerEvent::default());
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let mut workers = Vec::new();

        let buffer = BufferHandle::new(RollingBuffer::new(
            config.buffer.max_age_seconds,
            config.buffer.max_count,
        ));
        let ingest = MarkerIngest::new(&config.source.event_log);
        let ingest_stats = ingest.stats_handle();

        // Telemetry
        let mut telemetry_stats = None;
        let telemetry_tx = match connector {
            Some(connector) => {
                let broadcaster = TelemetryBroadcaster::new(
                    connector,
                    Duration::from_millis(config.telemetry.reconnect_base_ms),
                    Duration::from_millis(config.telemetry.reconnect_max_ms),
                );
                telemetry_stats = Some(broadcaster.stats_handle());
                let (tx, rx) = mpsc::unbounded_channel();
                workers.push((
                    "telemetry",
                    tokio::spawn(broadcaster.run(rx, shutdown.clone())),
                ));
                Some(tx)
            }
            None => {
                info!("Telemetry disabled");
                None
            }
        };

        // Marker ingest
        workers.push((
            "ingest",
            tokio::spawn(ingest.run(
                buffer.clone(),
                trigger_rx.clone(),
                telemetry_tx,
                Duration::from_millis(config.source.poll_interval_ms),
                shutdown.clone(),
            )),
        ));

        // Recording controller
        let controller = RecordingController::new(
            recorder,
            buffer.clone(),
            ingest_stats.clone(),
            ControllerSettings {
                output_directory: config.recording.output_directory.clone(),
                name_template: config.recording.name_template.clone(),
                container: config.recording.container.clone(),
                startup_grace: Duration::from_millis(config.recording.startup_grace_ms),
                stop_timeout: Duration::from_millis(config.recording.stop_timeout_ms),
                write_sidecar: config.recording.write_sidecar,
            },
            events.clone(),
        );
        let (recording, requests) = controller.handle();
        workers.push((
            "recording",
            tokio::spawn(controller.run(requests, shutdown.clone())),
        ));

        let status = StatusSources {
            buffer,
            ingest: ingest_stats,
            telemetry: telemetry_stats,
            trigger: trigger_rx,
            recorder: recording.subscribe(),
        };

        // Trigger dispatcher
        let dispatcher = TriggerDispatcher::new(
            trigger_tx,
            recording,
            status.clone(),
            config.remote.dedup_window(),
        );
        workers.push((
            "dispatcher",
            tokio::spawn(dispatcher.run(
                commands_rx,
                Duration::from_millis(config.dispatcher.tick_ms),
                shutdown.clone(),
            )),
        ));

        // Remote command channel
        match config.remote.endpoint.as_deref() {
            Some(endpoint) => {
                let remote = RemoteChannel::new(endpoint, &config.remote)?;
                workers.push((
                    "remote",
                    tokio::spawn(remote.run(
                        commands_tx.clone(),
                        events.subscribe(),
                        shutdown.clone(),
                    )),
                ));
            }
            None => info!("No remote endpoint configured, remote commands disabled"),
        }

        // Status reporter outlives the other workers to record the final state
        let reporter = StatusReporter::new(
            status.clone(),
            FileStatusWriter::new(&config.status.path),
            Duration::from_millis(config.status.interval_ms),
        );
        let reporter_task = tokio::spawn(reporter.run(reporter_shutdown.clone()));

        info!("Engine started with {} workers", workers.len() + 1);

        Ok(EngineHandle {
            commander: LocalCommander { tx: commands_tx },
            events,
            status,
            shutdown,
            reporter_shutdown,
            workers,
            reporter_task,
        })
    }
}

pub struct EngineHandle {
    commander: LocalCommander,
    events: broadcast::Sender<EngineEvent>,
    status: StatusSources,
    shutdown: CancellationToken,
    reporter_shutdown: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    reporter_task: JoinHandle<()>,
}

impl EngineHandle {
    /// Submit a command as the local operator and wait for its reply
    pub async fn local_command(&self, text: &str) -> Result<CommandReply> {
        self.commander.send(text).await
    }

    pub fn commander(&self) -> LocalCommander {
        self.commander.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> &StatusSources {
        &self.status
    }

    /// Token that stops the workers when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every worker, letting an active recording finalize first
    pub async fn shutdown(self) {
        info!("Engine shutting down");
        self.shutdown.cancel();

        for (name, task) in self.workers {
            match task.await {
                Ok(()) => debug!("Worker '{}' finished", name),
                Err(e) => error!("Worker '{}' failed: {}", name, e),
            }
        }

        self.reporter_shutdown.cancel();
        if let Err(e) = self.reporter_task.await {
            warn!("Status reporter failed: {}", e);
        }
        info!("Engine stopped");
    }
}

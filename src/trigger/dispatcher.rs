//! Trigger dispatcher
//!
//! Merges local and remote commands into one ordered stream. Commands that
//! arrive within one tick are applied Local first, and a Local
//! state-changing command supersedes any Remote one from the same tick.
//! Remote delivery is at-least-once, so a repeat of the last accepted remote
//! command inside the dedup window is coalesced instead of applied twice.

use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Command, TriggerEvent, TriggerKind};
use crate::recording::{RecordingHandle, StartOutcome, StopOutcome};
use crate::status::StatusSources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandSource {
    Local,
    Remote,
}

impl CommandSource {
    /// Tie-break order within a tick
    fn priority(self) -> u8 {
        match self {
            CommandSource::Local => 0,
            CommandSource::Remote => 1,
        }
    }
}

/// A raw command waiting for the next tick
#[derive(Debug)]
pub struct InboundCommand {
    pub source: CommandSource,
    pub text: String,
    /// Unix time of arrival
    pub received_at: f64,
    pub reply: Option<oneshot::Sender<CommandReply>>,
}

impl InboundCommand {
    pub fn new(source: CommandSource, text: impl Into<String>, received_at: f64) -> Self {
        Self {
            source,
            text: text.into(),
            received_at,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: oneshot::Sender<CommandReply>) -> Self {
        self.reply = Some(reply);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Recording state changed
    Accepted,
    /// Valid command that had nothing to do, e.g. stop while idle
    NoOp,
    /// Malformed, unknown, or violating the single-session rule
    Rejected,
    /// Redelivery of a command already applied
    Duplicate,
    /// Lost the same-tick tie-break to a local command
    Superseded,
    /// Answered a status query
    Query,
    /// Accepted but the recorder could not carry it out
    Failed,
}

/// Short human-readable acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub outcome: CommandOutcome,
    pub message: String,
}

impl CommandReply {
    fn new(outcome: CommandOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Last command that changed (or tried to change) recording state
#[derive(Debug, Clone)]
struct StateChange {
    source: CommandSource,
    command: Command,
    at: f64,
}

pub struct TriggerDispatcher {
    current: watch::Sender<TriggerEvent>,
    recording: RecordingHandle,
    status: StatusSources,
    dedup_window: Duration,
    last_change: Option<StateChange>,
}

impl TriggerDispatcher {
    pub fn new(
        current: watch::Sender<TriggerEvent>,
        recording: RecordingHandle,
        status: StatusSources,
        dedup_window: Duration,
    ) -> Self {
        Self {
            current,
            recording,
            status,
            dedup_window,
            last_change: None,
        }
    }

    pub fn current(&self) -> TriggerEvent {
        *self.current.borrow()
    }

    pub async fn accept_remote(&mut self, text: &str, now: f64) -> CommandReply {
        self.accept(CommandSource::Remote, text, now).await
    }

    pub async fn accept_local(&mut self, text: &str, now: f64) -> CommandReply {
        self.accept(CommandSource::Local, text, now).await
    }

    fn is_duplicate(&self, source: CommandSource, command: &Command, now: f64) -> bool {
        if source != CommandSource::Remote {
            return false;
        }
        match &self.last_change {
            Some(last) => {
                last.source == CommandSource::Remote
                    && last.command == *command
                    && (now - last.at).abs() <= self.dedup_window.as_secs_f64()
            }
            None => false,
        }
    }

    async fn accept(&mut self, source: CommandSource, text: &str, now: f64) -> CommandReply {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected {:?} command {:?}: {}", source, text, e);
                return CommandReply::new(CommandOutcome::Rejected, format!("rejected: {}", e));
            }
        };

        match command {
            Command::Status => CommandReply::new(CommandOutcome::Query, self.status.status_line()),
            Command::GetStats => {
                CommandReply::new(CommandOutcome::Query, self.status.stats_report())
            }
            Command::Unknown(verb) => {
                warn!("Rejected unknown {:?} command '{}'", source, verb);
                CommandReply::new(
                    CommandOutcome::Rejected,
                    format!("rejected: unknown command '{}'", verb),
                )
            }
            Command::StartRecording(_) | Command::StopRecording => {
                if self.is_duplicate(source, &command, now) {
                    info!("Coalesced duplicate remote command '{}'", command);
                    return CommandReply::new(
                        CommandOutcome::Duplicate,
                        format!("duplicate '{}' ignored", command),
                    );
                }
                self.apply(source, command, now).await
            }
        }
    }

    async fn apply(&mut self, source: CommandSource, command: Command, now: f64) -> CommandReply {
        let active = self.recording.is_active();
        let transitions = match command {
            Command::StartRecording(_) => !active,
            Command::StopRecording => active,
            _ => false,
        };

        // Telemetry provenance flips as soon as a transitioning command arrives
        if transitions {
            let trigger = TriggerEvent::new(TriggerKind::from(source), now, command.duration_secs());
            self.current.send_replace(trigger);
            self.last_change = Some(StateChange {
                source,
                command: command.clone(),
                at: now,
            });
            info!("Trigger {:?} '{}' at {:.3}", source, command, now);
        }

        match command {
            Command::StartRecording(duration) => {
                let trigger = self.current();
                match self.recording.start(duration, trigger).await {
                    Ok(StartOutcome::Started(session)) => CommandReply::new(
                        CommandOutcome::Accepted,
                        format!(
                            "recording started: {} ({})",
                            session.output_path.display(),
                            match session.duration_limit {
                                Some(secs) => format!("{}s", secs),
                                None => "until stopped".to_string(),
                            }
                        ),
                    ),
                    Ok(StartOutcome::AlreadyRecording(session)) => CommandReply::new(
                        CommandOutcome::Rejected,
                        format!("rejected: already recording ({})", session.id),
                    ),
                    Ok(StartOutcome::Failed(error)) => CommandReply::new(
                        CommandOutcome::Failed,
                        format!("recording failed: {}", error),
                    ),
                    Err(e) => CommandReply::new(CommandOutcome::Failed, format!("error: {:#}", e)),
                }
            }
            Command::StopRecording => match self.recording.stop().await {
                Ok(StopOutcome::Stopped(summary)) => {
                    CommandReply::new(CommandOutcome::Accepted, summary.describe())
                }
                Ok(StopOutcome::NotRecording) => {
                    CommandReply::new(CommandOutcome::NoOp, "not recording")
                }
                Err(e) => CommandReply::new(CommandOutcome::Failed, format!("error: {:#}", e)),
            },
            _ => CommandReply::new(CommandOutcome::Rejected, "rejected"),
        }
    }

    /// Apply every command of one tick: Local before Remote, arrival order
    /// otherwise, Remote state changes dropped when a Local one is present.
    pub async fn dispatch_tick(&mut self, mut batch: Vec<InboundCommand>) {
        batch.sort_by_key(|c| c.source.priority());

        let local_change = batch.iter().any(|c| {
            c.source == CommandSource::Local
                && Command::parse(&c.text).map_or(false, |cmd| cmd.is_state_changing())
        });

        for inbound in batch {
            let superseded = local_change
                && inbound.source == CommandSource::Remote
                && Command::parse(&inbound.text).map_or(false, |cmd| cmd.is_state_changing());

            let reply = if superseded {
                info!(
                    "Remote command '{}' superseded by a local command in the same tick",
                    inbound.text.trim()
                );
                CommandReply::new(
                    CommandOutcome::Superseded,
                    format!("'{}' superseded by local command", inbound.text.trim()),
                )
            } else {
                self.accept(inbound.source, &inbound.text, inbound.received_at)
                    .await
            };

            debug!("{:?} '{}' -> {:?}", inbound.source, inbound.text.trim(), reply.outcome);
            if let Some(tx) = inbound.reply {
                let _ = tx.send(reply);
            }
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<InboundCommand>,
        tick: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Trigger dispatcher started (tick {:?})", tick);

        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            // Everything arriving within one tick of the first command
            let mut batch = vec![first];
            let deadline = Instant::now() + tick;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    command = commands.recv() => match command {
                        Some(command) => batch.push(command),
                        None => break,
                    },
                }
            }

            self.dispatch_tick(batch).await;
        }

        info!("Trigger dispatcher stopped");
    }
}

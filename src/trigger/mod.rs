//! Trigger handling
//!
//! Commands arrive from two places: the remote command channel (polled over
//! HTTP, at-least-once delivery) and local calls such as keyboard input.
//! The dispatcher merges both into one ordered stream and owns the single
//! "current trigger" that tags telemetry and drives recording.

mod command;
mod dispatcher;
mod remote;

pub use command::{Command, CommandParseError};
pub use dispatcher::{
    CommandOutcome, CommandReply, CommandSource, InboundCommand, TriggerDispatcher,
};
pub use remote::{RemoteChannel, RemoteMessage};

use serde::{Deserialize, Serialize};

/// Where the current trigger came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    None,
    Local,
    Remote,
}

impl TriggerKind {
    /// Numeric code carried in telemetry samples
    pub fn code(self) -> i32 {
        match self {
            TriggerKind::None => 0,
            TriggerKind::Local => 1,
            TriggerKind::Remote => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::None => "none",
            TriggerKind::Local => "local",
            TriggerKind::Remote => "remote",
        }
    }
}

impl From<CommandSource> for TriggerKind {
    fn from(source: CommandSource) -> Self {
        match source {
            CommandSource::Local => TriggerKind::Local,
            CommandSource::Remote => TriggerKind::Remote,
        }
    }
}

/// The most recent accepted recording command
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub kind: TriggerKind,
    /// Unix time the command was accepted (0 when no trigger yet)
    pub time: f64,
    pub requested_duration: Option<f64>,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, time: f64, requested_duration: Option<f64>) -> Self {
        Self {
            kind,
            time,
            requested_duration,
        }
    }
}

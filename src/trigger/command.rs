//! Command grammar shared by the remote channel and local control
//!
//! ```text
//! start_recording [duration_seconds]
//! stop_recording
//! status
//! get_stats
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartRecording(Option<Duration>),
    StopRecording,
    Status,
    GetStats,
    /// A verb outside the grammar, kept for the rejection reply
    Unknown(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandParseError {
    #[error("empty command")]
    Empty,
    #[error("invalid duration '{0}': expected a positive number of seconds")]
    InvalidDuration(String),
    #[error("unexpected argument '{arg}' for {verb}")]
    UnexpectedArgument { verb: String, arg: String },
}

impl Command {
    pub fn parse(text: &str) -> Result<Self, CommandParseError> {
        text.parse()
    }

    /// Whether accepting this command can change recording state
    pub fn is_state_changing(&self) -> bool {
        matches!(self, Command::StartRecording(_) | Command::StopRecording)
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match self {
            Command::StartRecording(duration) => duration.map(|d| d.as_secs_f64()),
            _ => None,
        }
    }
}

impl FromStr for Command {
    type Err = CommandParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut words = text.split_whitespace();
        let verb = words.next().ok_or(CommandParseError::Empty)?.to_ascii_lowercase();
        let arg = words.next();
        if let Some(extra) = words.next() {
            return Err(CommandParseError::UnexpectedArgument {
                verb,
                arg: extra.to_string(),
            });
        }

        let no_arg = |command: Command| match arg {
            Some(arg) => Err(CommandParseError::UnexpectedArgument {
                verb: verb.clone(),
                arg: arg.to_string(),
            }),
            None => Ok(command),
        };

        match verb.as_str() {
            "start_recording" => {
                let duration = arg.map(parse_duration).transpose()?;
                Ok(Command::StartRecording(duration))
            }
            "stop_recording" => no_arg(Command::StopRecording),
            "status" => no_arg(Command::Status),
            "get_stats" => no_arg(Command::GetStats),
            _ => Ok(Command::Unknown(verb.clone())),
        }
    }
}

fn parse_duration(arg: &str) -> Result<Duration, CommandParseError> {
    match arg.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs > 0.0 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(CommandParseError::InvalidDuration(arg.to_string())),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::StartRecording(Some(duration)) => {
                write!(f, "start_recording {}", duration.as_secs_f64())
            }
            Command::StartRecording(None) => write!(f, "start_recording"),
            Command::StopRecording => write!(f, "stop_recording"),
            Command::Status => write!(f, "status"),
            Command::GetStats => write!(f, "get_stats"),
            Command::Unknown(verb) => write!(f, "{}", verb),
        }
    }
}

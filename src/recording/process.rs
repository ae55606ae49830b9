//! External encoder process
//!
//! The encoder is an opaque command-line tool: it gets an input source, an
//! output path, an optional duration and codec parameters. Its exit code and
//! the size of the file it leaves behind are all we observe.

use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to launch encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How the encoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    /// None when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// Per-session launch parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub output_path: PathBuf,
    pub duration: Option<Duration>,
}

/// A running encoder
pub trait RecordingProcess: Send + 'static {
    fn id(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> Result<Option<ProcessExit>, RecorderError>;

    /// Ask the process to finish, waiting at most `timeout` before killing it.
    /// Blocks; callers run it off the async executor.
    fn terminate(&mut self, timeout: Duration) -> Result<ProcessExit, RecorderError>;
}

/// Launches encoder processes
pub trait Recorder: Send + 'static {
    type Process: RecordingProcess;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Self::Process, RecorderError>;
}

/// Encoder invocation, ffmpeg-style by default
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderCommand {
    pub program: String,
    /// Capture device or stream URL
    pub input: String,
    /// Demuxer for the input (`-f`), empty to let the encoder detect it
    pub input_format: String,
    pub codec: String,
    /// Constant rate factor
    pub quality: Option<u32>,
    pub preset: Option<String>,
    /// Inserted just before the output path
    pub extra_args: Vec<String>,
}

impl EncoderCommand {
    pub fn args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-y".into()];
        if !self.input_format.is_empty() {
            args.extend(["-f".to_string(), self.input_format.clone()]);
        }
        args.extend(["-i".to_string(), self.input.clone()]);
        if let Some(duration) = spec.duration {
            args.extend(["-t".to_string(), format!("{:.3}", duration.as_secs_f64())]);
        }
        args.extend(["-c:v".to_string(), self.codec.clone()]);
        if let Some(quality) = self.quality {
            args.extend(["-crf".to_string(), quality.to_string()]);
        }
        if let Some(preset) = &self.preset {
            args.extend(["-preset".to_string(), preset.clone()]);
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(spec.output_path.to_string_lossy().into_owned());
        args
    }
}

pub struct ExternalRecorder {
    command: EncoderCommand,
}

impl ExternalRecorder {
    pub fn new(command: EncoderCommand) -> Self {
        Self { command }
    }
}

fn encoder_log_path(output: &Path) -> PathBuf {
    output.with_extension("encoder.log")
}

impl Recorder for ExternalRecorder {
    type Process = ExternalProcess;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<ExternalProcess, RecorderError> {
        let args = self.command.args(spec);
        debug!("Launching {} {:?}", self.command.program, args);

        let stderr = match File::create(encoder_log_path(&spec.output_path)) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!("Cannot create encoder log: {}", e);
                Stdio::null()
            }
        };

        let child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .spawn()
            .map_err(|source| RecorderError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        info!(
            "Encoder '{}' started (pid {}) writing {:?}",
            self.command.program,
            child.id(),
            spec.output_path
        );
        Ok(ExternalProcess { child })
    }
}

pub struct ExternalProcess {
    child: Child,
}

impl ExternalProcess {
    #[cfg(unix)]
    fn interrupt(&mut self) -> std::io::Result<()> {
        let pid = self.child.id() as libc::pid_t;
        // SIGINT lets ffmpeg-like encoders write their trailer
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }
}

impl RecordingProcess for ExternalProcess {
    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> Result<Option<ProcessExit>, RecorderError> {
        Ok(self.child.try_wait()?.map(ProcessExit::from))
    }

    fn terminate(&mut self, timeout: Duration) -> Result<ProcessExit, RecorderError> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }

        if let Err(e) = self.interrupt() {
            warn!("Failed to interrupt encoder: {}", e);
        }

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                return Ok(status.into());
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        warn!(
            "Encoder did not exit within {:?} of interrupt, killing it",
            timeout
        );
        self.child.kill()?;
        Ok(self.child.wait()?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> EncoderCommand {
        EncoderCommand {
            program: "ffmpeg".to_string(),
            input: "/dev/video0".to_string(),
            input_format: "v4l2".to_string(),
            codec: "libx264".to_string(),
            quality: Some(23),
            preset: Some("veryfast".to_string()),
            extra_args: vec!["-an".to_string()],
        }
    }

    #[test]
    fn test_args_with_duration() {
        let spec = LaunchSpec {
            output_path: PathBuf::from("/data/rec.mp4"),
            duration: Some(Duration::from_secs(2)),
        };
        assert_eq!(
            command().args(&spec),
            vec![
                "-hide_banner", "-y", "-f", "v4l2", "-i", "/dev/video0", "-t", "2.000",
                "-c:v", "libx264", "-crf", "23", "-preset", "veryfast", "-an",
                "/data/rec.mp4",
            ]
        );
    }

    #[test]
    fn test_args_minimal() {
        let mut cmd = command();
        cmd.input_format.clear();
        cmd.quality = None;
        cmd.preset = None;
        cmd.extra_args.clear();
        let spec = LaunchSpec {
            output_path: PathBuf::from("out.mkv"),
            duration: None,
        };
        assert_eq!(
            cmd.args(&spec),
            vec!["-hide_banner", "-y", "-i", "/dev/video0", "-c:v", "libx264", "out.mkv"]
        );
    }

    #[test]
    fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = command();
        cmd.program = "/nonexistent/encoder-binary".to_string();
        let mut recorder = ExternalRecorder::new(cmd);
        let spec = LaunchSpec {
            output_path: dir.path().join("rec.mp4"),
            duration: None,
        };
        assert!(matches!(
            recorder.launch(&spec),
            Err(RecorderError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_interrupts_running_process() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let mut process = ExternalProcess { child };
        assert!(process.try_wait().unwrap().is_none());

        let exit = process.terminate(Duration::from_secs(5)).unwrap();
        // Killed by SIGINT, so no exit code
        assert_eq!(exit.code, None);
    }
}

//! Configuration management for the framemark agent

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Frame source event log
    #[serde(default)]
    pub source: SourceConfig,

    /// Rolling pre-trigger buffer bounds
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Telemetry outlet
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Remote command channel
    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Encoder and output naming
    #[serde(default)]
    pub recording: RecordingConfig,

    /// Status file
    #[serde(default)]
    pub status: StatusConfig,

    /// Co-located control
    #[serde(default)]
    pub local: LocalConfig,

    /// Path to config file (not serialized)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Append-only `<index> <timestamp>` log written by the capture process
    #[serde(default = "default_event_log")]
    pub event_log: PathBuf,

    /// Sleep between polls when no new data is available (ms)
    #[serde(default = "default_source_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_max_age_seconds")]
    pub max_age_seconds: f64,

    #[serde(default = "default_max_count")]
    pub max_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UDP `host:port` of the telemetry consumer
    #[serde(default = "default_telemetry_target")]
    pub target: String,

    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    #[serde(default = "default_stream_type")]
    pub stream_type: String,

    #[serde(default = "default_source_id")]
    pub source_id: String,

    /// Announced sample rate; 0 for irregular
    #[serde(default)]
    pub nominal_rate_hz: f64,

    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the ntfy-style server; the remote channel is off when unset
    pub endpoint: Option<String>,

    #[serde(default = "default_topic")]
    pub topic: String,

    /// Where acknowledgements are published
    pub reply_topic: Option<String>,

    #[serde(default = "default_remote_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Duplicate coalescing window (defaults to two polling intervals)
    pub dedup_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Commands arriving within this window are one tick (ms)
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default = "default_recording_output_directory")]
    pub output_directory: PathBuf,

    /// Output file stem; `{timestamp}` and `{session}` are substituted
    #[serde(default = "default_name_template")]
    pub name_template: String,

    /// Output file extension
    #[serde(default = "default_container")]
    pub container: String,

    /// Encoder executable
    #[serde(default = "default_program")]
    pub program: String,

    /// Capture device or stream URL handed to the encoder
    #[serde(default = "default_input")]
    pub input: String,

    #[serde(default = "default_input_format")]
    pub input_format: String,

    #[serde(default = "default_codec")]
    pub codec: String,

    /// Constant rate factor
    #[serde(default = "default_quality")]
    pub quality: Option<u32>,

    #[serde(default = "default_preset")]
    pub preset: Option<String>,

    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_startup_grace")]
    pub startup_grace_ms: u64,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// Write `<stem>.json` with session statistics
    #[serde(default = "default_true")]
    pub write_sidecar: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_status_path")]
    pub path: PathBuf,

    #[serde(default = "default_status_interval")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Read keyboard commands from stdin
    #[serde(default = "default_true")]
    pub stdin_commands: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "framemark", "agent")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("framemark"))
}

fn default_event_log() -> PathBuf {
    data_dir().join("frames.txt")
}

fn default_source_poll_interval() -> u64 {
    20
}

fn default_max_age_seconds() -> f64 {
    10.0
}

fn default_max_count() -> usize {
    3000
}

fn default_telemetry_target() -> String {
    "127.0.0.1:16571".to_string()
}

fn default_stream_name() -> String {
    "framemark".to_string()
}

fn default_stream_type() -> String {
    "Markers".to_string()
}

fn default_source_id() -> String {
    "framemark-agent".to_string()
}

fn default_reconnect_base() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_topic() -> String {
    "framemark".to_string()
}

fn default_remote_poll_interval() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_tick() -> u64 {
    50
}

fn default_recording_output_directory() -> PathBuf {
    data_dir().join("recordings")
}

fn default_name_template() -> String {
    "recording_{timestamp}_{session}".to_string()
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

fn default_input() -> String {
    if cfg!(target_os = "macos") {
        "0".to_string()
    } else {
        "/dev/video0".to_string()
    }
}

fn default_input_format() -> String {
    if cfg!(target_os = "macos") {
        "avfoundation".to_string()
    } else if cfg!(target_os = "windows") {
        "dshow".to_string()
    } else {
        "v4l2".to_string()
    }
}

fn default_codec() -> String {
    "libx264".to_string()
}

fn default_quality() -> Option<u32> {
    Some(23)
}

fn default_preset() -> Option<String> {
    Some("veryfast".to_string())
}

fn default_startup_grace() -> u64 {
    500
}

fn default_stop_timeout() -> u64 {
    5000
}

fn default_status_path() -> PathBuf {
    data_dir().join("status.json")
}

fn default_status_interval() -> u64 {
    1000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            event_log: default_event_log(),
            poll_interval_ms: default_source_poll_interval(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_age_seconds: default_max_age_seconds(),
            max_count: default_max_count(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: default_telemetry_target(),
            stream_name: default_stream_name(),
            stream_type: default_stream_type(),
            source_id: default_source_id(),
            nominal_rate_hz: 0.0,
            reconnect_base_ms: default_reconnect_base(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            topic: default_topic(),
            reply_topic: None,
            poll_interval_ms: default_remote_poll_interval(),
            request_timeout_ms: default_request_timeout(),
            dedup_window_ms: None,
        }
    }
}

impl RemoteConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(
            self.dedup_window_ms
                .unwrap_or(self.poll_interval_ms.saturating_mul(2)),
        )
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_directory: default_recording_output_directory(),
            name_template: default_name_template(),
            container: default_container(),
            program: default_program(),
            input: default_input(),
            input_format: default_input_format(),
            codec: default_codec(),
            quality: default_quality(),
            preset: default_preset(),
            extra_args: Vec::new(),
            startup_grace_ms: default_startup_grace(),
            stop_timeout_ms: default_stop_timeout(),
            write_sidecar: true,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            path: default_status_path(),
            interval_ms: default_status_interval(),
        }
    }
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            stdin_commands: true,
        }
    }
}

impl Config {
    /// Load configuration from default location or create default
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let mut config = Config::default();
            config.config_path = Some(config_path);
            config.save()?;
            Ok(config)
        }
    }

    /// Load an explicitly given file; it must exist and parse
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.config_path = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = self.config_path()?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        Ok(())
    }

    /// Get the config file path
    pub fn config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_config_path(),
        }
    }

    /// Get default config path
    fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = directories::ProjectDirs::from("dev", "framemark", "agent")
            .context("Failed to determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.buffer.max_age_seconds.is_finite() && self.buffer.max_age_seconds > 0.0) {
            bail!("buffer.max_age_seconds must be a positive number of seconds");
        }
        if self.buffer.max_count == 0 {
            bail!("buffer.max_count must be at least 1");
        }
        if self.source.poll_interval_ms == 0 {
            bail!("source.poll_interval_ms must be greater than 0");
        }
        if self.remote.poll_interval_ms == 0 {
            bail!("remote.poll_interval_ms must be greater than 0");
        }
        if self.remote.request_timeout_ms == 0 {
            bail!("remote.request_timeout_ms must be greater than 0");
        }
        if self.dispatcher.tick_ms == 0 {
            bail!("dispatcher.tick_ms must be greater than 0");
        }
        if self.status.interval_ms == 0 {
            bail!("status.interval_ms must be greater than 0");
        }
        if self.telemetry.enabled {
            if self.telemetry.reconnect_base_ms == 0
                || self.telemetry.reconnect_max_ms < self.telemetry.reconnect_base_ms
            {
                bail!("telemetry reconnect backoff must satisfy 0 < reconnect_base_ms <= reconnect_max_ms");
            }
            if self.telemetry.nominal_rate_hz < 0.0 {
                bail!("telemetry.nominal_rate_hz must not be negative");
            }
        }
        if self.recording.program.trim().is_empty() {
            bail!("recording.program must name an encoder executable");
        }
        if self.recording.container.trim().is_empty() {
            bail!("recording.container must not be empty");
        }
        if self.remote.endpoint.is_some() && self.remote.topic.trim().is_empty() {
            bail!("remote.topic must be set when remote.endpoint is configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [buffer]
            max_count = 5

            [remote]
            endpoint = "https://ntfy.sh"
            topic = "lab-camera"
            poll_interval_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer.max_count, 5);
        assert_eq!(config.buffer.max_age_seconds, 10.0);
        assert_eq!(config.source.poll_interval_ms, 20);
        assert_eq!(config.dispatcher.tick_ms, 50);
        assert_eq!(config.remote.dedup_window(), Duration::from_millis(3000));
        assert_eq!(config.recording.program, "ffmpeg");
        assert!(config.telemetry.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = Config::default();
        config.buffer.max_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.buffer.max_age_seconds = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.telemetry.reconnect_max_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_missing_or_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from(&dir.path().join("missing.toml")).is_err());

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[buffer\nmax_count = ").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.config_path = Some(path.clone());
        config.recording.extra_args = vec!["-an".to_string()];
        config.save().unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.recording.extra_args, vec!["-an".to_string()]);
        assert_eq!(loaded.config_path().unwrap(), path);
    }
}

//! framemark agent
//!
//! Tails a frame-marker log from an external capture process, keeps a
//! rolling pre-trigger buffer, streams per-frame telemetry, and starts and
//! stops an external encoder on local or remote triggers.

mod clock;
mod config;
mod logging;
mod markers;
mod recording;
mod status;
mod sync;
mod telemetry;
mod trigger;

use anyhow::{bail, Context, Result};
use std::io::BufRead;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use config::Config;
use recording::{EncoderCommand, ExternalRecorder};
use sync::{Engine, EngineEvent, LocalCommander};
use telemetry::{SinkConnector, StreamInfo, UdpConnector};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    let config_arg = parse_config_arg(&args)?;

    // Keep the guard alive so buffered log lines are flushed on exit
    let _log_guard = logging::init_logging()?;
    info!("framemark agent starting...");

    // Configuration problems are fatal before any worker starts
    let config = match config_arg {
        Some(path) => Config::load_from(&path)?,
        None => {
            let config = Config::load()?;
            config.validate()?;
            config
        }
    };
    if let Ok(path) = config.config_path() {
        info!("Configuration loaded from {:?}", path);
    }

    let recorder = ExternalRecorder::new(EncoderCommand {
        program: config.recording.program.clone(),
        input: config.recording.input.clone(),
        input_format: config.recording.input_format.clone(),
        codec: config.recording.codec.clone(),
        quality: config.recording.quality,
        preset: config.recording.preset.clone(),
        extra_args: config.recording.extra_args.clone(),
    });

    let connector: Option<Box<dyn SinkConnector>> = if config.telemetry.enabled {
        Some(Box::new(UdpConnector::new(
            config.telemetry.target.clone(),
            StreamInfo {
                name: config.telemetry.stream_name.clone(),
                stream_type: config.telemetry.stream_type.clone(),
                channel_count: 3,
                nominal_rate_hz: config.telemetry.nominal_rate_hz,
                source_id: config.telemetry.source_id.clone(),
            },
        )))
    } else {
        None
    };

    let stdin_commands = config.local.stdin_commands;
    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;

    runtime.block_on(async move {
        let engine = Engine::new(config, recorder, connector)
            .start()
            .context("Failed to start engine")?;

        let shutdown = engine.shutdown_token();
        let ctrl_c = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, shutting down...");
            ctrl_c.cancel();
        })?;

        if stdin_commands {
            spawn_stdin_reader(engine.commander());
            info!("Type commands (start_recording [seconds], stop_recording, status, get_stats)");
        }
        info!("Press Ctrl+C to exit...");

        let mut events = engine.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Missed {} engine events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        engine.shutdown().await;
        anyhow::Ok(())
    })?;

    info!("Shutdown complete");
    Ok(())
}

fn parse_config_arg(args: &[String]) -> Result<Option<PathBuf>> {
    let mut iter = args.iter().skip(1);
    let mut path = None;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => match iter.next() {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("{} requires a path", arg),
            },
            other => match other.strip_prefix("--config=") {
                Some(value) => path = Some(PathBuf::from(value)),
                None => bail!("Unknown argument '{}' (see --help)", other),
            },
        }
    }
    Ok(path)
}

/// Read operator commands line by line and print their replies
fn spawn_stdin_reader(commander: LocalCommander) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Stopped reading stdin: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match commander.send_blocking(&line) {
                Ok(reply) => println!("{}", reply),
                Err(e) => {
                    debug!("Local command not delivered: {}", e);
                    break;
                }
            }
        }
    });
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::RecordingStarted { session } => {
            info!(
                "Recording {} active ({} pre-trigger markers)",
                session.id, session.pretrigger_markers
            );
        }
        EngineEvent::RecordingFinished { summary } => info!("{}", summary.describe()),
        EngineEvent::RecordingFailed { error } => error!("Recording failed: {}", error),
    }
}

fn print_help() {
    println!("framemark agent - frame markers, pre-trigger buffer, telemetry and triggered recording");
    println!();
    println!("USAGE:");
    println!("    framemark-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>   Use this configuration file (must exist)");
    println!("    -h, --help            Print this help message");
    println!();
    println!("COMMANDS (stdin or remote topic):");
    println!("    start_recording [seconds]");
    println!("    stop_recording");
    println!("    status");
    println!("    get_stats");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG             Set log level (e.g., debug, info, warn)");
    println!("    FRAMEMARK_LOG_PATH   Override the log directory");
}

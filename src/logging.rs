//! Log output: a daily file under the platform log directory plus stderr,
//! and os_log on macOS. `RUST_LOG` filters all of them.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "framemark.log";
const LOG_DIR_ENV: &str = "FRAMEMARK_LOG_PATH";
const LOG_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Install the global subscriber. Buffered file output is flushed when the
/// returned guard drops.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = match std::env::var_os(LOG_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => default_log_dir()?,
    };
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
    let pruned = prune_old_logs(&log_dir, LOG_RETENTION);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        // stdout carries command replies
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(platform_layer())
        .init();

    tracing::debug!("Logging to {:?} ({} old files removed)", log_dir, pruned);
    Ok(guard)
}

#[cfg(target_os = "macos")]
fn platform_layer<S>() -> Option<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    Some(Box::new(tracing_oslog::OsLogger::new(
        "dev.framemark.agent",
        "default",
    )))
}

#[cfg(not(target_os = "macos"))]
fn platform_layer<S>() -> Option<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    None
}

#[cfg(target_os = "macos")]
fn default_log_dir() -> Result<PathBuf> {
    let home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join("Library/Logs/framemark"))
}

#[cfg(not(target_os = "macos"))]
fn default_log_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("dev", "framemark", "agent")
        .context("No home directory to place logs in")?;
    // state_dir is only defined on Linux
    let base = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
    Ok(base.join("logs"))
}

/// Remove our own rotated log files last modified before `max_age` ago.
/// Returns how many were removed.
fn prune_old_logs(log_dir: &Path, max_age: Duration) -> usize {
    let (Ok(entries), Some(cutoff)) = (
        std::fs::read_dir(log_dir),
        SystemTime::now().checked_sub(max_age),
    ) else {
        return 0;
    };

    entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| {
            entry
                .metadata()
                .ok()
                .filter(|meta| meta.is_file())
                .and_then(|meta| meta.modified().ok())
                .is_some_and(|modified| modified < cutoff)
        })
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("{}.2026-01-01", LOG_FILE_PREFIX));
        let other = dir.path().join("notes.txt");
        std::fs::write(&log, "x").unwrap();
        std::fs::write(&other, "y").unwrap();

        assert_eq!(prune_old_logs(dir.path(), Duration::from_secs(3600)), 0);
        assert!(log.exists());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(prune_old_logs(dir.path(), Duration::ZERO), 1);
        assert!(!log.exists());
        assert!(other.exists());
    }
}

//! Logging setup.
//!
//! - Console output with local timezone timestamps (text or JSON)
//! - Optional daily rolling log file through a non-blocking writer
//! - Log file retention cleanup (deletes logs older than 7 days)

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::utils::fs;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "clipforge=info,tower_http=info";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Rolled log files are named `clipforge.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "clipforge.log";

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Logging options.
#[derive(Debug, Clone, Default)]
pub struct LoggingSettings {
    /// Write a daily rolling log file here as well as to the console.
    pub log_dir: Option<PathBuf>,
    /// Emit console logs as JSON lines.
    pub json: bool,
}

/// Keeps the file writer alive. Dropping it flushes and stops file logging.
pub struct LoggingHandle {
    log_dir: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LoggingHandle {
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// Start the daily log retention cleanup. Does nothing without a log dir.
    pub fn start_retention_cleanup(&self, cancel_token: CancellationToken) -> Option<JoinHandle<()>> {
        let log_dir = self.log_dir.clone()?;

        Some(tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {
                        if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                            warn!(error = %e, "Failed to cleanup old logs");
                        }
                    }
                }
            }
        }))
    }
}

/// Delete rolled log files older than `retention_days`.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).date_naive();

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(date_str) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
        else {
            continue;
        };

        let Ok(file_date) = chrono::NaiveDate::parse_from_str(date_str, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted_count += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`].
/// Keep the returned handle alive for the lifetime of the process.
pub fn init_logging(settings: &LoggingSettings) -> crate::Result<LoggingHandle> {
    let (file_layer, guard) = match &settings.log_dir {
        Some(log_dir) => {
            fs::ensure_dir_all_sync_with_op("creating log directory", log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let text_layer = (!settings.json).then(|| fmt::layer().with_ansi(true).with_timer(LocalTimer));
    let json_layer = settings
        .json
        .then(|| fmt::layer().json().with_timer(LocalTimer));

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| crate::Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    Ok(LoggingHandle {
        log_dir: settings.log_dir.clone(),
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_targets_the_crate() {
        assert!(DEFAULT_LOG_FILTER.contains("clipforge=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[tokio::test]
    async fn retention_deletes_only_old_rolled_files() {
        let dir = tempfile::tempdir().unwrap();
        let today = Local::now().format("%Y-%m-%d").to_string();

        let old = dir.path().join("clipforge.log.2020-01-01");
        let current = dir.path().join(format!("clipforge.log.{today}"));
        let unrelated = dir.path().join("other.log.2020-01-01");
        for path in [&old, &current, &unrelated] {
            std::fs::write(path, b"log").unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(!old.exists());
        assert!(current.exists());
        assert!(unrelated.exists());
    }
}

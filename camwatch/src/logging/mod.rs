//! Logging with a reloadable filter and daily rolling files.
//!
//! This module provides:
//! - Runtime log level changes via `tracing_subscriber::reload`
//! - Log file retention cleanup
//! - Local timezone timestamps for logs

use chrono::{Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "camwatch=info,rtsp=info,sqlx=warn";

/// Prefix of the daily log files (`camwatch.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "camwatch.log";

const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_RETENTION_DAYS: i64 = 7;

/// How often retention runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub dir: String,
    /// Filter directive; `RUST_LOG` takes precedence at startup.
    pub filter: String,
    pub retention_days: i64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: DEFAULT_LOG_DIR.to_string(),
            filter: DEFAULT_LOG_FILTER.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Custom timer that uses the local timezone via chrono.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Type alias for the reload handle.
pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the installed subscriber.
pub struct LoggingConfig {
    handle: FilterHandle,
    log_dir: PathBuf,
}

impl LoggingConfig {
    fn new(handle: FilterHandle, log_dir: PathBuf) -> Self {
        Self { handle, log_dir }
    }

    /// Get the current filter directive string.
    pub fn get_filter(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }

    /// Replace the filter directive, e.g. `camwatch=debug,rtsp=trace`.
    pub fn set_filter(&self, directive: &str) -> crate::Result<()> {
        let new_filter = parse_filter(directive)?;

        self.handle
            .reload(new_filter)
            .map_err(|e| crate::Error::Other(format!("Failed to reload filter: {}", e)))?;

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Start the log retention cleanup task.
    ///
    /// Runs once at startup and then daily.
    pub fn start_retention_cleanup(
        self: &Arc<Self>,
        retention_days: i64,
        cancel_token: CancellationToken,
    ) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, retention_days, Utc::now().date_naive()).await
                {
                    warn!(error = %e, "Failed to cleanup old logs");
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                }
            }
        });
    }
}

fn parse_filter(directive: &str) -> crate::Result<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| crate::Error::config(format!("Invalid filter directive: {}", e)))
}

/// Path of the rolled log file for `date` (the appender rolls on UTC dates).
pub(crate) fn daily_log_file(log_dir: &Path, date: NaiveDate) -> PathBuf {
    log_dir.join(format!("{LOG_FILE_PREFIX}.{}", date.format("%Y-%m-%d")))
}

/// Date encoded in a rolled log file name.
fn log_file_date(filename: &str) -> Option<NaiveDate> {
    let date_str = filename.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").ok()
}

/// Delete log files older than `retention_days` before `today`.
async fn cleanup_old_logs(
    log_dir: &Path,
    retention_days: i64,
    today: NaiveDate,
) -> std::io::Result<usize> {
    let cutoff = today - chrono::Duration::days(retention_days.max(0));

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted_count = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let Some(file_date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(log_file_date)
        else {
            continue;
        };

        if file_date < cutoff {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to delete old log file");
            } else {
                deleted_count += 1;
                debug!(path = %path.display(), "Deleted old log file");
            }
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "Cleaned up old log files");
    }

    Ok(deleted_count)
}

/// Install the global subscriber: console plus a daily rolling file in
/// `log_dir`. Keep the guard alive for the life of the process.
pub fn init_logging(
    log_dir: &str,
    filter: &str,
) -> crate::Result<(Arc<LoggingConfig>, WorkerGuard)> {
    let log_path = PathBuf::from(log_dir);
    std::fs::create_dir_all(&log_path)?;

    let file_appender = tracing_appender::rolling::daily(&log_path, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| {
            crate::Error::Other(format!("Failed to set global default subscriber: {}", e))
        })?;

    let config = Arc::new(LoggingConfig::new(filter_handle, log_path));

    Ok((config, guard))
}

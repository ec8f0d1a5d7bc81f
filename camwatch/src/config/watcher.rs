//! Polls the configuration file and applies changes to the running engine.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AppConfig, parse_config};
use crate::logging::LoggingConfig;
use crate::registry::{ReloadReport, StreamRegistry};
use crate::scheduler::SchedulerConfig;
use crate::status::StatusAggregator;

pub struct ConfigWatcher {
    path: PathBuf,
    registry: Arc<StreamRegistry>,
    engine_tx: watch::Sender<SchedulerConfig>,
    aggregator: Arc<StatusAggregator>,
    logging: Option<Arc<LoggingConfig>>,
    current: AppConfig,
    /// Raw text of the last file seen, valid or not.
    last_text: Option<String>,
}

impl ConfigWatcher {
    /// `current` and `text` describe the configuration already applied.
    pub fn new(
        path: impl Into<PathBuf>,
        current: AppConfig,
        text: Option<String>,
        registry: Arc<StreamRegistry>,
        engine_tx: watch::Sender<SchedulerConfig>,
        aggregator: Arc<StatusAggregator>,
    ) -> Self {
        Self {
            path: path.into(),
            registry,
            engine_tx,
            aggregator,
            logging: None,
            current,
            last_text: text,
        }
    }

    /// Also apply `[logging] filter` changes.
    pub fn with_logging(mut self, logging: Arc<LoggingConfig>) -> Self {
        self.logging = Some(logging);
        self
    }

    pub async fn run(mut self, cancel_token: CancellationToken) {
        let interval = self.current.watch.poll_interval();
        info!(path = %self.path.display(), "Watching config file every {:?}", interval);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!("Config watcher shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    self.poll().await;
                }
            }
        }
    }

    /// Re-read the file once. Returns the reload report when the stream
    /// list was applied.
    pub async fn poll(&mut self) -> Option<ReloadReport> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Config file missing; keeping current fleet");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read config file");
                return None;
            }
        };

        if self.last_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        let parsed = parse_config(&text);
        self.last_text = Some(text);

        match parsed {
            Ok(next) => Some(self.apply(next)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Ignoring invalid config file; keeping current fleet"
                );
                None
            }
        }
    }

    fn apply(&mut self, next: AppConfig) -> ReloadReport {
        let report = self.registry.load(&next.streams);
        if report.is_unchanged() {
            debug!(generation = report.generation, "Stream list unchanged");
        } else {
            info!(
                generation = report.generation,
                accepted = report.accepted,
                rejected = report.rejected.len(),
                added = report.added.len(),
                removed = report.removed.len(),
                updated = report.updated.len(),
                "Stream list reloaded"
            );
        }

        self.engine_tx.send_if_modified(|engine| {
            if *engine == next.engine {
                return false;
            }
            *engine = next.engine.clone();
            true
        });
        self.aggregator.set_window_size(next.engine.uptime_window);

        if next.logging.filter != self.current.logging.filter
            && let Some(logging) = &self.logging
            && let Err(e) = logging.set_filter(&next.logging.filter)
        {
            warn!(error = %e, "Keeping previous log filter");
        }

        if next.engine.pull_stream.require_media != self.current.engine.pull_stream.require_media
            || next.engine.pull_stream.user_agent != self.current.engine.pull_stream.user_agent
            || next.engine.poll_image.max_payload_bytes != self.current.engine.poll_image.max_payload_bytes
            || next.engine.poll_image.user_agent != self.current.engine.poll_image.user_agent
        {
            warn!("Prober settings other than timeouts take effect after a restart");
        }
        if next.storage != self.current.storage || next.server != self.current.server {
            warn!("[storage] and [server] changes take effect after a restart");
        }

        self.current = next;
        report
    }
}

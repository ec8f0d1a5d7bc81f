//! Service container.
//!
//! Builds the registry, store, writer, aggregator and scheduler from one
//! [`AppConfig`], starts the background tasks, and tears them down again.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::api::{ApiServer, AppState};
use crate::config::{AppConfig, ConfigWatcher};
use crate::database::repositories::{HeartbeatStore, SqlxHeartbeatStore};
use crate::database::{DbPool, HeartbeatWriter};
use crate::logging::LoggingConfig;
use crate::probe::ProberSet;
use crate::registry::StreamRegistry;
use crate::scheduler::{ProbeScheduler, ResultRouter, SchedulerConfig, SchedulerStats};
use crate::status::StatusAggregator;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: DbPool,
    pub registry: Arc<StreamRegistry>,
    pub aggregator: Arc<StatusAggregator>,
    pub store: Arc<dyn HeartbeatStore>,
    pub writer: Arc<HeartbeatWriter>,
    config: AppConfig,
    config_path: PathBuf,
    /// Raw text the current config was parsed from.
    config_text: Option<String>,
    engine_tx: watch::Sender<SchedulerConfig>,
    scheduler_stats: Mutex<Option<Arc<SchedulerStats>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build the container with network probers.
    pub async fn new(
        config_path: impl Into<PathBuf>,
        config: AppConfig,
        config_text: Option<String>,
        pool: DbPool,
    ) -> Result<Self> {
        let probers = ProberSet::network(
            config.engine.pull_stream.clone(),
            config.engine.poll_image.clone(),
        )?;
        Self::with_probers(config_path, config, config_text, pool, probers).await
    }

    pub async fn with_probers(
        config_path: impl Into<PathBuf>,
        config: AppConfig,
        config_text: Option<String>,
        pool: DbPool,
        probers: ProberSet,
    ) -> Result<Self> {
        info!("Initializing service container");
        config.timezone()?;

        let registry = Arc::new(StreamRegistry::new(probers));
        let report = registry.load(&config.streams);
        info!(
            accepted = report.accepted,
            rejected = report.rejected.len(),
            "Loaded {} streams",
            report.accepted
        );

        let aggregator = Arc::new(StatusAggregator::new(config.engine.uptime_window));
        let store: Arc<dyn HeartbeatStore> = Arc::new(SqlxHeartbeatStore::new(pool.clone()));
        let writer = Arc::new(HeartbeatWriter::new(store.clone(), &config.storage.writer));
        let (engine_tx, _) = watch::channel(config.engine.clone());

        Ok(Self {
            pool,
            registry,
            aggregator,
            store,
            writer,
            config_path: config_path.into(),
            config_text,
            engine_tx,
            config,
            scheduler_stats: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Seed the aggregator from persisted history. Returns how many streams
    /// had history.
    pub async fn initialize(&self) -> Result<usize> {
        let limit = self.config.storage.hydrate_records;
        if limit == 0 {
            return Ok(0);
        }

        let mut hydrated = 0;
        for stream in self.registry.snapshot().streams() {
            match self.store.latest_records(stream.name(), limit).await {
                Ok(records) if !records.is_empty() => {
                    self.aggregator.hydrate(stream.name(), &records);
                    hydrated += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(stream = %stream.name(), error = %e, "Failed to load history"),
            }
        }
        info!("Hydrated status for {} streams", hydrated);
        Ok(hydrated)
    }

    /// Spawn the scheduler, the config watcher and the API server.
    pub fn start(&self, logging: Option<Arc<LoggingConfig>>) {
        let token = self.cancellation_token.clone();
        let mut tasks = self.tasks.lock();

        let sink = Arc::new(ResultRouter::new(
            Some(self.writer.clone()),
            self.aggregator.clone(),
        ));
        let scheduler = ProbeScheduler::new(
            self.registry.clone(),
            sink,
            self.engine_tx.subscribe(),
            token.child_token(),
        );
        let stats = scheduler.stats();
        *self.scheduler_stats.lock() = Some(stats.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                error!("Scheduler stopped with error: {}", e);
            }
        }));

        if self.config.watch.enabled {
            let mut watcher = ConfigWatcher::new(
                self.config_path.clone(),
                self.config.clone(),
                self.config_text.clone(),
                self.registry.clone(),
                self.engine_tx.clone(),
                self.aggregator.clone(),
            );
            if let Some(logging) = logging {
                watcher = watcher.with_logging(logging);
            }
            tasks.push(tokio::spawn(watcher.run(token.child_token())));
        }

        if self.config.server.enabled {
            let state = AppState::new(self.registry.clone(), self.aggregator.clone())
                .with_store(self.store.clone())
                .with_scheduler_stats(stats)
                .with_timezone(self.config.timezone().unwrap_or(chrono_tz::Tz::UTC));
            let server = ApiServer::new(self.config.server.clone(), state, token.child_token());
            let shutdown = token.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("API server failed: {}", e);
                    shutdown.cancel();
                }
            }));
        }

        info!("Services started");
    }

    /// Stop background tasks, flush pending heartbeats and close the pool.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let joined = tokio::time::timeout(timeout, async {
            for task in tasks {
                if let Err(e) = task.await {
                    debug!("Background task ended abnormally: {}", e);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Flushing heartbeat writer...");
        self.writer.shutdown().await;
        if self.writer.dropped() > 0 {
            warn!("{} heartbeats were not persisted", self.writer.dropped());
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Scheduler counters, once started.
    pub fn scheduler_stats(&self) -> Option<Arc<SchedulerStats>> {
        self.scheduler_stats.lock().clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

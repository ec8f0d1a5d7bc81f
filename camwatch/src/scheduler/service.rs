//! Probe scheduler service.
//!
//! One coordinator task owns the [`ScheduleTable`]. It wakes on a fixed
//! tick, adopts new registry generations, dispatches due streams as
//! short-lived probe tasks up to the concurrency ceiling, and applies their
//! results as they come back over a single channel.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::HeartbeatWriter;
use crate::database::models::HeartbeatRecord;
use crate::panic_hook::payload_message;
use crate::probe::{
    PollImageConfig, ProbeOutcome, ProbeRequest, ProbeResult, Prober, PullStreamConfig,
};
use crate::registry::{Protocol, RegisteredStream, StreamRegistry};
use crate::status::{DEFAULT_UPTIME_WINDOW, StatusAggregator};

use super::backoff::BackoffPolicy;
use super::state::{Completion, ScheduleTable};

/// Default tick cadence (1 second).
const DEFAULT_TICK_INTERVAL_MS: u64 = 1000;

/// Default ceiling on simultaneous probes.
const DEFAULT_MAX_CONCURRENT_PROBES: usize = 50;

/// Default probe interval for healthy streams (15 seconds).
const DEFAULT_BASE_INTERVAL_SECS: u64 = 15;

/// Default upper bound for the backoff interval (5 minutes).
const DEFAULT_MAX_INTERVAL_SECS: u64 = 300;

const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_BACKOFF_EXPONENT_CAP: u32 = 5;
const DEFAULT_JITTER_FRACTION: f64 = 0.1;

/// Lower bound for the tick cadence.
const MIN_TICK_INTERVAL_MS: u64 = 10;

/// Engine tunables (`[engine]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub max_concurrent_probes: usize,
    pub base_interval_secs: u64,
    pub max_interval_secs: u64,
    pub backoff_multiplier: f64,
    pub backoff_exponent_cap: u32,
    pub jitter_fraction: f64,
    /// Rolling uptime window, in probes.
    pub uptime_window: usize,
    pub pull_stream: PullStreamConfig,
    pub poll_image: PollImageConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_concurrent_probes: DEFAULT_MAX_CONCURRENT_PROBES,
            base_interval_secs: DEFAULT_BASE_INTERVAL_SECS,
            max_interval_secs: DEFAULT_MAX_INTERVAL_SECS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            backoff_exponent_cap: DEFAULT_BACKOFF_EXPONENT_CAP,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            uptime_window: DEFAULT_UPTIME_WINDOW,
            pull_stream: PullStreamConfig::default(),
            poll_image: PollImageConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Clamp values into a usable range.
    pub fn normalized(mut self) -> Self {
        self.tick_interval_ms = self.tick_interval_ms.max(MIN_TICK_INTERVAL_MS);
        self.max_concurrent_probes = self.max_concurrent_probes.max(1);
        self.base_interval_secs = self.base_interval_secs.max(1);
        self.max_interval_secs = self.max_interval_secs.max(self.base_interval_secs);
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            self.backoff_multiplier = 1.0;
        }
        self.jitter_fraction = if self.jitter_fraction.is_finite() {
            self.jitter_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.uptime_window = self.uptime_window.max(1);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(MIN_TICK_INTERVAL_MS))
    }

    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_interval: Duration::from_secs(self.base_interval_secs),
            max_interval: Duration::from_secs(self.max_interval_secs),
            multiplier: self.backoff_multiplier,
            exponent_cap: self.backoff_exponent_cap,
            jitter_fraction: self.jitter_fraction,
        }
    }

    pub fn timeout_for(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::PullStream => self.pull_stream.timeout(),
            Protocol::PollImage => self.poll_image.timeout(),
        }
    }
}

/// Receives what the scheduler learns. Called only from the scheduler loop.
pub trait ResultSink: Send + Sync {
    /// A result for a stream that is still configured.
    fn on_result(&self, result: &ProbeResult);

    /// A result for a stream removed while its probe was running.
    fn on_orphaned(&self, result: &ProbeResult);

    /// The scheduler adopted a new registry generation.
    fn on_reconciled(&self, active: &HashSet<String>);
}

/// Forwards results to the heartbeat writer and the status aggregator.
pub struct ResultRouter {
    writer: Option<Arc<HeartbeatWriter>>,
    aggregator: Arc<StatusAggregator>,
}

impl ResultRouter {
    pub fn new(writer: Option<Arc<HeartbeatWriter>>, aggregator: Arc<StatusAggregator>) -> Self {
        Self { writer, aggregator }
    }

    fn persist(&self, result: &ProbeResult) {
        if let Some(writer) = &self.writer {
            writer.submit(HeartbeatRecord::from(result));
        }
    }
}

impl ResultSink for ResultRouter {
    fn on_result(&self, result: &ProbeResult) {
        self.persist(result);
        self.aggregator.update(result);
    }

    fn on_orphaned(&self, result: &ProbeResult) {
        self.persist(result);
    }

    fn on_reconciled(&self, active: &HashSet<String>) {
        self.aggregator.retain(active);
    }
}

/// Counters shared with the API.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    orphaned: AtomicU64,
    ticks: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    streams: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStatsSnapshot {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub orphaned: u64,
    pub ticks: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub streams: usize,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerStatsSnapshot {
        SchedulerStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            streams: self.streams.load(Ordering::Relaxed),
        }
    }

    fn set_in_flight(&self, count: usize) {
        self.in_flight.store(count, Ordering::Relaxed);
        self.peak_in_flight.fetch_max(count, Ordering::Relaxed);
    }
}

/// The coordinator. Build it, grab [`stats`](Self::stats), then `run` it.
pub struct ProbeScheduler {
    registry: Arc<StreamRegistry>,
    sink: Arc<dyn ResultSink>,
    config: SchedulerConfig,
    config_rx: watch::Receiver<SchedulerConfig>,
    policy: BackoffPolicy,
    table: ScheduleTable,
    tasks: JoinSet<()>,
    result_tx: mpsc::UnboundedSender<ProbeResult>,
    result_rx: mpsc::UnboundedReceiver<ProbeResult>,
    stats: Arc<SchedulerStats>,
    cancellation_token: CancellationToken,
}

impl ProbeScheduler {
    pub fn new(
        registry: Arc<StreamRegistry>,
        sink: Arc<dyn ResultSink>,
        config_rx: watch::Receiver<SchedulerConfig>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let config = config_rx.borrow().clone().normalized();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            sink,
            policy: config.policy(),
            config,
            config_rx,
            table: ScheduleTable::new(),
            tasks: JoinSet::new(),
            result_tx,
            result_rx,
            stats: Arc::new(SchedulerStats::default()),
            cancellation_token,
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Run until the cancellation token fires.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Starting probe scheduler: tick {} ms, ceiling {}, interval {}s..{}s",
            self.config.tick_interval_ms,
            self.config.max_concurrent_probes,
            self.config.base_interval_secs,
            self.config.max_interval_secs,
        );

        let mut ticker = Self::ticker(self.config.tick_interval());
        let mut config_open = true;

        loop {
            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("Scheduler received cancellation signal");
                    break;
                }

                Some(result) = self.result_rx.recv() => {
                    self.handle_result(result, Instant::now());
                }

                changed = self.config_rx.changed(), if config_open => {
                    match changed {
                        Ok(()) => {
                            let next = self.config_rx.borrow_and_update().clone();
                            if self.apply_config(next) {
                                ticker = Self::ticker(self.config.tick_interval());
                            }
                        }
                        Err(_) => {
                            debug!("Scheduler config channel closed");
                            config_open = false;
                        }
                    }
                }

                joined = Self::join_next_if_pending(&mut self.tasks) => {
                    if let Some(Err(e)) = joined
                        && !e.is_cancelled()
                    {
                        error!("Probe task failed: {}", e);
                    }
                }

                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn ticker(period: Duration) -> Interval {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Wait for the next probe task to finish, or forever if none is running.
    async fn join_next_if_pending(
        tasks: &mut JoinSet<()>,
    ) -> Option<std::result::Result<(), tokio::task::JoinError>> {
        if tasks.is_empty() {
            std::future::pending().await
        } else {
            tasks.join_next().await
        }
    }

    fn tick(&mut self, now: Instant) {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.registry.snapshot();
        if let Some(diff) = self.table.reconcile(&snapshot, now, self.policy.base_interval) {
            if !diff.added.is_empty() || !diff.removed.is_empty() {
                info!(
                    generation = diff.generation,
                    added = diff.added.len(),
                    removed = diff.removed.len(),
                    "Schedule reconciled with registry"
                );
            }
            for name in &diff.removed {
                debug!(stream = %name, "Stream removed from schedule");
            }
            self.stats.streams.store(self.table.len(), Ordering::Relaxed);
            self.sink.on_reconciled(&self.table.names());
        }

        for stream in self.table.take_due(now, self.config.max_concurrent_probes) {
            self.dispatch(stream);
        }
        self.stats.set_in_flight(self.table.in_flight_count());
    }

    fn dispatch(&mut self, stream: Arc<RegisteredStream>) {
        let definition = &stream.definition;
        let request = ProbeRequest {
            stream_name: definition.name.clone(),
            protocol: definition.protocol,
            endpoint: definition.endpoint.clone(),
            timeout: self.config.timeout_for(definition.protocol),
        };
        let prober = stream.prober.clone();
        let tx = self.result_tx.clone();

        debug!(stream = %request.stream_name, protocol = %request.protocol, "Dispatching probe");
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        self.tasks.spawn(async move {
            let result = run_probe(prober, request).await;
            // The receiver only goes away at shutdown.
            let _ = tx.send(result);
        });
    }

    fn handle_result(&mut self, result: ProbeResult, now: Instant) {
        let completion = self
            .table
            .complete(&result, &self.policy, now, rand::random::<f64>());
        self.stats.set_in_flight(self.table.in_flight_count());
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        if !result.outcome.is_success() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }

        match completion {
            Completion::Rescheduled {
                previous,
                consecutive_failures,
                interval,
            } => {
                if previous != Some(result.outcome) {
                    let from = previous.as_ref().map(ProbeOutcome::as_str).unwrap_or("unknown");
                    if result.outcome.is_success() {
                        info!(
                            stream = %result.stream_name,
                            latency_ms = result.latency_ms(),
                            "Stream status {} -> {}",
                            from,
                            result.outcome,
                        );
                    } else {
                        warn!(
                            stream = %result.stream_name,
                            message = %result.message,
                            "Stream status {} -> {}",
                            from,
                            result.outcome,
                        );
                    }
                }
                debug!(
                    stream = %result.stream_name,
                    outcome = %result.outcome,
                    latency_ms = result.latency_ms(),
                    consecutive_failures,
                    next_in_secs = interval.as_secs(),
                    "Probe completed"
                );
                self.sink.on_result(&result);
            }
            Completion::Orphaned => {
                self.stats.orphaned.fetch_add(1, Ordering::Relaxed);
                debug!(
                    stream = %result.stream_name,
                    outcome = %result.outcome,
                    "Probe completed for removed stream"
                );
                self.sink.on_orphaned(&result);
            }
        }
    }

    /// Adopt new tunables. Returns true when the tick cadence changed.
    fn apply_config(&mut self, next: SchedulerConfig) -> bool {
        let next = next.normalized();
        if next == self.config {
            return false;
        }

        info!(
            "Scheduler config updated: max_concurrent_probes {}->{}; base_interval_secs {}->{}; max_interval_secs {}->{}; tick_interval_ms {}->{}",
            self.config.max_concurrent_probes,
            next.max_concurrent_probes,
            self.config.base_interval_secs,
            next.base_interval_secs,
            self.config.max_interval_secs,
            next.max_interval_secs,
            self.config.tick_interval_ms,
            next.tick_interval_ms,
        );

        let tick_changed = next.tick_interval_ms != self.config.tick_interval_ms;
        self.policy = next.policy();
        self.config = next;
        tick_changed
    }

    async fn shutdown(&mut self) {
        let outstanding = self.tasks.len();
        info!("Shutting down scheduler ({} probes outstanding)", outstanding);
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

/// Run one probe under its timeout. A panicking prober yields a
/// `ProtocolError` result so the in-flight slot is always released.
pub(crate) async fn run_probe(prober: Arc<dyn Prober>, request: ProbeRequest) -> ProbeResult {
    let started = Instant::now();
    let probe = AssertUnwindSafe(prober.probe(&request)).catch_unwind();
    match tokio::time::timeout(request.timeout, probe).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => {
            let message = payload_message(payload.as_ref());
            error!(stream = %request.stream_name, "Prober panicked: {}", message);
            ProbeResult::new(
                &request,
                ProbeOutcome::ProtocolError,
                started.elapsed(),
                format!("prober panicked: {message}"),
            )
        }
        Err(_) => ProbeResult::timed_out(&request, started.elapsed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProberSet;
    use crate::registry::StreamEntry;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedProber {
        outcome: ProbeOutcome,
        delay: Duration,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        fn protocol(&self) -> Protocol {
            Protocol::PullStream
        }

        async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
            tokio::time::sleep(self.delay).await;
            ProbeResult::new(request, self.outcome, self.delay, "scripted")
        }
    }

    struct PanickingProber;

    #[async_trait]
    impl Prober for PanickingProber {
        fn protocol(&self) -> Protocol {
            Protocol::PollImage
        }

        async fn probe(&self, _request: &ProbeRequest) -> ProbeResult {
            panic!("decoder exploded");
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        results: Mutex<Vec<ProbeResult>>,
        orphaned: Mutex<Vec<ProbeResult>>,
        reconciled: Mutex<Vec<HashSet<String>>>,
    }

    impl ResultSink for RecordingSink {
        fn on_result(&self, result: &ProbeResult) {
            self.results.lock().push(result.clone());
        }

        fn on_orphaned(&self, result: &ProbeResult) {
            self.orphaned.lock().push(result.clone());
        }

        fn on_reconciled(&self, active: &HashSet<String>) {
            self.reconciled.lock().push(active.clone());
        }
    }

    fn request(timeout: Duration) -> ProbeRequest {
        ProbeRequest {
            stream_name: "cam".to_string(),
            protocol: Protocol::PullStream,
            endpoint: "rtsp://10.0.0.1/live".to_string(),
            timeout,
        }
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval_ms, 1000);
        assert_eq!(config.max_concurrent_probes, 50);
        assert_eq!(config.policy().base_interval, Duration::from_secs(15));
        assert_eq!(config.policy().max_interval, Duration::from_secs(300));
        assert_eq!(config.timeout_for(Protocol::PullStream), Duration::from_secs(5));
        assert_eq!(config.timeout_for(Protocol::PollImage), Duration::from_secs(3));
    }

    #[test]
    fn test_scheduler_config_normalized() {
        let config = SchedulerConfig {
            tick_interval_ms: 0,
            max_concurrent_probes: 0,
            base_interval_secs: 60,
            max_interval_secs: 10,
            backoff_multiplier: 0.5,
            jitter_fraction: 7.0,
            uptime_window: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.tick_interval_ms, MIN_TICK_INTERVAL_MS);
        assert_eq!(config.max_concurrent_probes, 1);
        assert_eq!(config.max_interval_secs, 60);
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.jitter_fraction, 1.0);
        assert_eq!(config.uptime_window, 1);
    }

    #[test]
    fn test_scheduler_config_partial_toml() {
        let config: SchedulerConfig =
            toml::from_str("max_concurrent_probes = 8\n[pull_stream]\ntimeout_ms = 2500\n")
                .unwrap();
        assert_eq!(config.max_concurrent_probes, 8);
        assert_eq!(config.pull_stream.timeout_ms, 2500);
        assert!(config.pull_stream.require_media);
        assert_eq!(config.base_interval_secs, 15);
    }

    #[tokio::test]
    async fn test_run_probe_converts_panic() {
        let result = run_probe(Arc::new(PanickingProber), request(Duration::from_secs(1))).await;
        assert_eq!(result.outcome, ProbeOutcome::ProtocolError);
        assert!(result.message.contains("decoder exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_probe_enforces_timeout() {
        let prober = Arc::new(ScriptedProber {
            outcome: ProbeOutcome::Success,
            delay: Duration::from_secs(30),
        });
        let result = run_probe(prober, request(Duration::from_secs(2))).await;
        assert_eq!(result.outcome, ProbeOutcome::Timeout);
        assert_eq!(result.latency, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_probes_and_backs_off() {
        let prober: Arc<dyn Prober> = Arc::new(ScriptedProber {
            outcome: ProbeOutcome::Timeout,
            delay: Duration::from_millis(100),
        });
        let registry = Arc::new(StreamRegistry::new(ProberSet::new(prober.clone(), prober)));
        registry.load(&[StreamEntry::new("B", "rtsp://10.0.0.2/live")]);

        let sink = Arc::new(RecordingSink::default());
        let config = SchedulerConfig {
            jitter_fraction: 0.0,
            ..Default::default()
        };
        let (_config_tx, config_rx) = watch::channel(config);
        let cancel = CancellationToken::new();
        let scheduler = ProbeScheduler::new(registry, sink.clone(), config_rx, cancel.clone());
        let stats = scheduler.stats();
        let handle = tokio::spawn(scheduler.run());

        // Probes at t=0, 16 s and 47 s; after the third failure the next is 60 s out.
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(sink.results.lock().len(), 3);
        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(sink.results.lock().len(), 3);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(sink.results.lock().len(), 4);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        let stats = stats.snapshot();
        assert_eq!(stats.completed, 4);
        assert_eq!(stats.failed, 4);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.peak_in_flight, 1);
        assert_eq!(sink.reconciled.lock().len(), 1);
    }
}

//! Status aggregator.
//!
//! Keeps the latest probe result and rolling uptime per stream. Entries are
//! replaced whole, and readers get a copy of the map, so a reader never sees
//! a half-updated entry.

pub mod window;

pub use window::UptimeWindow;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::database::models::HeartbeatRecord;
use crate::probe::{ProbeOutcome, ProbeResult};
use crate::registry::Protocol;

/// Default rolling window, in probes.
pub const DEFAULT_UPTIME_WINDOW: usize = 1000;

/// Latest-known state of one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshotEntry {
    pub protocol: Protocol,
    pub outcome: ProbeOutcome,
    pub latency_ms: u64,
    pub message: String,
    pub observed_at: DateTime<Utc>,
    pub uptime_ratio: f64,
    /// Number of probes the ratio is computed over.
    pub window_len: usize,
}

/// Copy of every entry at one instant.
pub type StatusSnapshot = HashMap<String, Arc<StatusSnapshotEntry>>;

/// Serialized form of an entry with `observed_at` in the display timezone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub protocol: Protocol,
    pub outcome: ProbeOutcome,
    pub latency_ms: u64,
    pub message: String,
    pub observed_at: String,
    pub uptime_ratio: f64,
}

impl StatusView {
    pub fn render(entry: &StatusSnapshotEntry, tz: Tz) -> Self {
        Self {
            protocol: entry.protocol,
            outcome: entry.outcome,
            latency_ms: entry.latency_ms,
            message: entry.message.clone(),
            observed_at: entry.observed_at.with_timezone(&tz).to_rfc3339(),
            uptime_ratio: entry.uptime_ratio,
        }
    }
}

pub struct StatusAggregator {
    entries: RwLock<StatusSnapshot>,
    windows: Mutex<HashMap<String, UptimeWindow>>,
    window_size: Mutex<usize>,
}

impl StatusAggregator {
    pub fn new(window_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
            window_size: Mutex::new(window_size.max(1)),
        }
    }

    /// Record a probe result, replacing the stream's entry.
    pub fn update(&self, result: &ProbeResult) {
        let entry = {
            let size = *self.window_size.lock();
            let mut windows = self.windows.lock();
            let window = windows
                .entry(result.stream_name.clone())
                .or_insert_with(|| UptimeWindow::new(size));
            window.push(result.outcome.is_success());
            StatusSnapshotEntry {
                protocol: result.protocol,
                outcome: result.outcome,
                latency_ms: result.latency_ms(),
                message: result.message.clone(),
                observed_at: result.observed_at,
                uptime_ratio: window.ratio(),
                window_len: window.len(),
            }
        };
        self.entries
            .write()
            .insert(result.stream_name.clone(), Arc::new(entry));
    }

    /// Seed a stream from persisted history (oldest first).
    ///
    /// Ignored when the stream already has live results.
    pub fn hydrate(&self, stream_name: &str, records: &[HeartbeatRecord]) {
        let Some(last) = records.last() else {
            return;
        };
        if self.entries.read().contains_key(stream_name) {
            return;
        }

        let entry = {
            let size = *self.window_size.lock();
            let mut windows = self.windows.lock();
            let mut window = UptimeWindow::new(size);
            for record in records {
                window.push(record.outcome.is_success());
            }
            let entry = StatusSnapshotEntry {
                protocol: last.protocol,
                outcome: last.outcome,
                latency_ms: last.latency_ms.max(0) as u64,
                message: last.message.clone(),
                observed_at: last.observed_at,
                uptime_ratio: window.ratio(),
                window_len: window.len(),
            };
            windows.insert(stream_name.to_string(), window);
            entry
        };
        self.entries
            .write()
            .insert(stream_name.to_string(), Arc::new(entry));
    }

    /// Drop entries for streams no longer configured.
    pub fn retain(&self, names: &HashSet<String>) {
        self.windows.lock().retain(|name, _| names.contains(name));
        self.entries.write().retain(|name, _| names.contains(name));
    }

    pub fn set_window_size(&self, size: usize) {
        let size = size.max(1);
        let mut current = self.window_size.lock();
        if *current == size {
            return;
        }
        *current = size;
        for window in self.windows.lock().values_mut() {
            window.resize(size);
        }
    }

    pub fn window_size(&self) -> usize {
        *self.window_size.lock()
    }

    /// Copy of the current map. Absent names have never been probed.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.entries.read().clone()
    }

    pub fn get(&self, stream_name: &str) -> Option<Arc<StatusSnapshotEntry>> {
        self.entries.read().get(stream_name).cloned()
    }

    /// Snapshot rendered for output, sorted by stream name.
    pub fn render(&self, tz: Tz) -> BTreeMap<String, StatusView> {
        self.snapshot()
            .iter()
            .map(|(name, entry)| (name.clone(), StatusView::render(entry, tz)))
            .collect()
    }
}

impl Default for StatusAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_UPTIME_WINDOW)
    }
}

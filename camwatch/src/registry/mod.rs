//! Stream registry.
//!
//! Holds the current [`RegistrySnapshot`] behind an `Arc` that is swapped
//! whole on reload, so readers always see a complete stream list.

pub mod definition;
pub mod snapshot;

pub use definition::{Protocol, StreamDefinition, StreamEntry};
pub use snapshot::{RegisteredStream, RegistrySnapshot};

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use crate::probe::ProberSet;

/// An entry rejected during reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEntry {
    /// Position of the entry in the submitted list.
    pub index: usize,
    pub name: String,
    pub reason: String,
}

/// Outcome of [`StreamRegistry::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub generation: u64,
    pub accepted: usize,
    pub rejected: Vec<RejectedEntry>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ReloadReport {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

pub struct StreamRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    probers: ProberSet,
    /// Serializes loads so generations are assigned in order.
    load_lock: Mutex<()>,
}

impl StreamRegistry {
    pub fn new(probers: ProberSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
            probers,
            load_lock: Mutex::new(()),
        }
    }

    /// Current snapshot. Cheap; clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Validate `entries` and atomically replace the snapshot.
    ///
    /// Invalid entries are skipped and reported; the rest take effect.
    /// Unchanged definitions keep their existing [`RegisteredStream`], and a
    /// load that changes nothing keeps the current generation.
    pub fn load(&self, entries: &[StreamEntry]) -> ReloadReport {
        let _guard = self.load_lock.lock();
        let previous = self.snapshot();

        let mut report = ReloadReport::default();
        let mut seen = HashSet::new();
        let mut streams = Vec::with_capacity(entries.len());

        for (index, entry) in entries.iter().enumerate() {
            let definition = match StreamDefinition::try_from(entry) {
                Ok(def) => def,
                Err(reason) => {
                    report.rejected.push(RejectedEntry {
                        index,
                        name: entry.name.clone(),
                        reason,
                    });
                    continue;
                }
            };
            if !seen.insert(definition.name.clone()) {
                report.rejected.push(RejectedEntry {
                    index,
                    name: definition.name.clone(),
                    reason: "duplicate name".to_string(),
                });
                continue;
            }

            let stream = match previous.get(&definition.name) {
                Some(existing) if existing.definition == definition => existing.clone(),
                Some(_) => {
                    report.updated.push(definition.name.clone());
                    self.register(definition)
                }
                None => {
                    report.added.push(definition.name.clone());
                    self.register(definition)
                }
            };
            streams.push(stream);
        }

        report.removed = previous
            .streams()
            .iter()
            .filter(|s| !seen.contains(s.name()))
            .map(|s| s.name().to_string())
            .collect();
        report.accepted = streams.len();

        for rejected in &report.rejected {
            warn!(
                index = rejected.index,
                stream = %rejected.name,
                reason = %rejected.reason,
                "Rejected stream entry"
            );
        }

        let order_changed = streams.len() != previous.len()
            || streams
                .iter()
                .zip(previous.streams())
                .any(|(a, b)| !Arc::ptr_eq(a, b));

        if report.is_unchanged() && !order_changed {
            report.generation = previous.generation();
            return report;
        }

        let generation = previous.generation() + 1;
        report.generation = generation;
        *self.current.write() = Arc::new(RegistrySnapshot::new(generation, streams));

        info!(
            generation,
            accepted = report.accepted,
            rejected = report.rejected.len(),
            added = report.added.len(),
            removed = report.removed.len(),
            updated = report.updated.len(),
            "Stream registry reloaded"
        );
        report
    }

    fn register(&self, definition: StreamDefinition) -> Arc<RegisteredStream> {
        let prober = self.probers.for_protocol(definition.protocol);
        Arc::new(RegisteredStream { definition, prober })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeOutcome, ProbeRequest, ProbeResult, Prober};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoopProber(Protocol);

    #[async_trait]
    impl Prober for NoopProber {
        fn protocol(&self) -> Protocol {
            self.0
        }

        async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
            ProbeResult::new(request, ProbeOutcome::Success, Duration::ZERO, "ok")
        }
    }

    fn registry() -> StreamRegistry {
        StreamRegistry::new(ProberSet::new(
            Arc::new(NoopProber(Protocol::PullStream)),
            Arc::new(NoopProber(Protocol::PollImage)),
        ))
    }

    #[test]
    fn test_load_selects_prober_per_protocol() {
        let registry = registry();
        let report = registry.load(&[
            StreamEntry::new("gate", "rtsp://10.0.0.2/live"),
            StreamEntry::new("lobby", "http://10.0.0.3/snap.jpg"),
        ]);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.added, vec!["gate", "lobby"]);
        assert_eq!(report.generation, 1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.get("gate").unwrap().prober.protocol(), Protocol::PullStream);
        assert_eq!(snapshot.get("lobby").unwrap().prober.protocol(), Protocol::PollImage);
    }

    #[test]
    fn test_bad_entry_does_not_block_others() {
        let registry = registry();
        let report = registry.load(&[
            StreamEntry::new("gate", "rtsp://10.0.0.2/live"),
            StreamEntry::new("", "rtsp://10.0.0.9/live"),
            StreamEntry::new("gate", "rtsp://10.0.0.4/live"),
            StreamEntry::new("dock", "ftp://10.0.0.5/"),
            StreamEntry::new("lobby", "http://10.0.0.3/snap.jpg"),
        ]);
        assert_eq!(report.accepted, 2);
        let indexes: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);
        assert_eq!(report.rejected[1].reason, "duplicate name");
        // first occurrence wins
        assert_eq!(
            registry.snapshot().get("gate").unwrap().definition.endpoint,
            "rtsp://10.0.0.2/live"
        );
    }

    #[test]
    fn test_identical_reload_keeps_generation_and_streams() {
        let registry = registry();
        let entries = vec![StreamEntry::new("gate", "rtsp://10.0.0.2/live")];
        registry.load(&entries);
        let before = registry.snapshot();

        let report = registry.load(&entries);
        assert!(report.is_unchanged());
        let after = registry.snapshot();
        assert_eq!(after.generation(), before.generation());
        assert!(Arc::ptr_eq(&before.streams()[0], &after.streams()[0]));
    }

    #[test]
    fn test_reload_diff() {
        let registry = registry();
        registry.load(&[
            StreamEntry::new("a", "rtsp://10.0.0.1/live"),
            StreamEntry::new("b", "rtsp://10.0.0.2/live"),
        ]);
        let report = registry.load(&[
            StreamEntry::new("a", "rtsp://10.0.0.1/live").disabled(),
            StreamEntry::new("c", "http://10.0.0.3/snap.jpg"),
        ]);
        assert_eq!(report.updated, vec!["a"]);
        assert_eq!(report.added, vec!["c"]);
        assert_eq!(report.removed, vec!["b"]);
        assert_eq!(report.generation, 2);
        assert!(!registry.snapshot().get("a").unwrap().definition.enabled);
    }

    #[test]
    fn test_readers_keep_old_snapshot() {
        let registry = registry();
        registry.load(&[StreamEntry::new("a", "rtsp://10.0.0.1/live")]);
        let held = registry.snapshot();
        registry.load(&[]);
        assert_eq!(held.len(), 1);
        assert!(registry.snapshot().is_empty());
    }
}

//! Per-stream scheduling state, owned by the scheduler loop.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::probe::{ProbeOutcome, ProbeResult};
use crate::registry::{RegisteredStream, RegistrySnapshot};

use super::backoff::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub stream: Arc<RegisteredStream>,
    pub next_due_at: Instant,
    pub consecutive_failures: u32,
    pub current_interval: Duration,
    pub in_flight: bool,
    pub last_outcome: Option<ProbeOutcome>,
}

impl ScheduleState {
    fn new(stream: Arc<RegisteredStream>, now: Instant, base_interval: Duration) -> Self {
        Self {
            stream,
            next_due_at: now,
            consecutive_failures: 0,
            current_interval: base_interval,
            in_flight: false,
            last_outcome: None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.stream.definition.enabled && !self.in_flight && self.next_due_at <= now
    }
}

/// Changes applied while adopting a new registry generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub generation: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// What [`ScheduleTable::complete`] did with a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// State updated and next probe scheduled.
    Rescheduled {
        previous: Option<ProbeOutcome>,
        consecutive_failures: u32,
        interval: Duration,
    },
    /// The stream was removed while its probe ran; nothing to reschedule.
    Orphaned,
}

/// Scheduling state for every configured stream.
///
/// `outstanding` tracks probes that have been dispatched but whose result
/// has not been applied yet, including probes of streams removed in the
/// meantime. Its size is the in-flight count checked against the ceiling.
#[derive(Debug, Default)]
pub struct ScheduleTable {
    states: HashMap<String, ScheduleState>,
    outstanding: HashSet<String>,
    generation: Option<u64>,
}

impl ScheduleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt `snapshot` if its generation differs from the last one seen.
    ///
    /// New streams are due immediately; removed streams lose their state;
    /// surviving streams keep their timing and pick up the new definition.
    /// A stream switched from disabled to enabled becomes due immediately,
    /// and one whose endpoint or protocol changed starts over as if new.
    pub fn reconcile(
        &mut self,
        snapshot: &RegistrySnapshot,
        now: Instant,
        base_interval: Duration,
    ) -> Option<Reconciled> {
        if self.generation == Some(snapshot.generation()) {
            return None;
        }
        self.generation = Some(snapshot.generation());

        let mut diff = Reconciled {
            generation: snapshot.generation(),
            ..Default::default()
        };

        self.states.retain(|name, _| {
            let keep = snapshot.contains(name);
            if !keep {
                diff.removed.push(name.clone());
            }
            keep
        });
        diff.removed.sort();

        for stream in snapshot.streams() {
            match self.states.get_mut(stream.name()) {
                Some(state) => {
                    let old = &state.stream.definition;
                    let target_changed = old.endpoint != stream.definition.endpoint
                        || old.protocol != stream.definition.protocol;
                    let was_enabled = old.enabled;
                    state.stream = stream.clone();
                    if target_changed {
                        state.consecutive_failures = 0;
                        state.current_interval = base_interval;
                        state.next_due_at = now;
                    } else if !was_enabled && stream.definition.enabled {
                        state.next_due_at = now;
                    }
                }
                None => {
                    let mut state = ScheduleState::new(stream.clone(), now, base_interval);
                    state.in_flight = self.outstanding.contains(stream.name());
                    self.states.insert(stream.name().to_string(), state);
                    diff.added.push(stream.name().to_string());
                }
            }
        }

        Some(diff)
    }

    /// Mark up to `ceiling - in_flight` due streams as in flight, earliest
    /// `next_due_at` first, and return them for dispatch.
    pub fn take_due(&mut self, now: Instant, ceiling: usize) -> Vec<Arc<RegisteredStream>> {
        let capacity = ceiling.saturating_sub(self.outstanding.len());
        if capacity == 0 {
            return Vec::new();
        }

        let mut due: Vec<&ScheduleState> = self.states.values().filter(|s| s.is_due(now)).collect();
        due.sort_by(|a, b| match a.next_due_at.cmp(&b.next_due_at) {
            Ordering::Equal => a.stream.name().cmp(b.stream.name()),
            other => other,
        });
        let picked: Vec<Arc<RegisteredStream>> = due
            .into_iter()
            .take(capacity)
            .map(|s| s.stream.clone())
            .collect();

        for stream in &picked {
            if let Some(state) = self.states.get_mut(stream.name()) {
                state.in_flight = true;
            }
            self.outstanding.insert(stream.name().to_string());
        }
        picked
    }

    /// Apply a probe result: release the in-flight slot and compute the next
    /// due time. `jitter_sample` is in `[0, 1)`.
    pub fn complete(
        &mut self,
        result: &ProbeResult,
        policy: &BackoffPolicy,
        now: Instant,
        jitter_sample: f64,
    ) -> Completion {
        self.outstanding.remove(&result.stream_name);

        let Some(state) = self.states.get_mut(&result.stream_name) else {
            return Completion::Orphaned;
        };

        let previous = state.last_outcome;
        if result.outcome.is_success() {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        state.current_interval = policy.interval_for(state.consecutive_failures);
        state.next_due_at = now + policy.jittered(state.current_interval, jitter_sample);
        state.in_flight = false;
        state.last_outcome = Some(result.outcome);

        Completion::Rescheduled {
            previous,
            consecutive_failures: state.consecutive_failures,
            interval: state.current_interval,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ScheduleState> {
        self.states.get(name)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Probes dispatched and not yet completed.
    pub fn in_flight_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, name: &str) -> bool {
        self.outstanding.contains(name)
    }

    pub fn names(&self) -> HashSet<String> {
        self.states.keys().cloned().collect()
    }

    /// Earliest `next_due_at` among dispatchable streams.
    pub fn next_due(&self) -> Option<Instant> {
        self.states
            .values()
            .filter(|s| s.stream.definition.enabled && !s.in_flight)
            .map(|s| s.next_due_at)
            .min()
    }
}

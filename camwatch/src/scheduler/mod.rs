//! Probe scheduler: adaptive intervals, a concurrency ceiling and result
//! routing.

pub mod backoff;
pub mod service;
pub mod state;

pub use backoff::BackoffPolicy;
pub use service::{
    ProbeScheduler, ResultRouter, ResultSink, SchedulerConfig, SchedulerStats,
    SchedulerStatsSnapshot,
};
pub use state::{Completion, Reconciled, ScheduleState, ScheduleTable};

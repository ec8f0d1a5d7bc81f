//! Failure-driven probe interval policy.

use std::time::Duration;

/// Exponential backoff between probes of a failing stream.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Upper bound on the exponent.
    pub exponent_cap: u32,
    /// Maximum fraction added on top of an interval, in `[0, 1]`.
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(300),
            multiplier: 2.0,
            exponent_cap: 5,
            jitter_fraction: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Interval to wait after `consecutive_failures` failures in a row.
    ///
    /// The first failure keeps the base interval; each further failure
    /// multiplies it, up to `max_interval`. Zero failures is the base.
    /// The exponent is `failures - 1`, so with a 15 s base and multiplier 2
    /// three timeouts in a row wait 15 s, 30 s, then 60 s.
    pub fn interval_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.base_interval;
        }
        let exponent = (consecutive_failures - 1).min(self.exponent_cap);
        let factor = self.multiplier.max(1.0).powi(exponent as i32);
        let secs = self.base_interval.as_secs_f64() * factor;
        let max = self.max_interval.max(self.base_interval);
        if !secs.is_finite() || secs >= max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Stretch `interval` by up to `jitter_fraction`; `sample` is in `[0, 1)`.
    pub fn jittered(&self, interval: Duration, sample: f64) -> Duration {
        let fraction = self.jitter_fraction.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        interval.mul_f64(1.0 + fraction)
    }
}

//! Busy-retry for SQLite writes.
//!
//! The heartbeat writer and the API read the same file; a writer holding
//! the lock past `busy_timeout` surfaces as `SQLITE_BUSY`, which is worth a
//! few more attempts before a batch is given up.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::Result;

const MAX_ATTEMPTS: u32 = 6;
const FIRST_DELAY: Duration = Duration::from_millis(20);
const MAX_DELAY: Duration = Duration::from_millis(800);

/// Delay before retry number `attempt` (0-based): doubling from
/// [`FIRST_DELAY`], capped, plus up to a quarter of random extra.
fn busy_delay(attempt: u32, sample: f64) -> Duration {
    let base = FIRST_DELAY
        .saturating_mul(1u32 << attempt.min(16))
        .min(MAX_DELAY);
    let extra = base.mul_f64(sample.clamp(0.0, 1.0) * 0.25);
    (base + extra).min(MAX_DELAY)
}

/// Run `op`, retrying while SQLite reports the database busy or locked.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_sqlite_busy() && attempt < MAX_ATTEMPTS => {
                let delay = busy_delay(attempt, rand::random::<f64>());
                attempt += 1;
                debug!(op = op_name, attempt, "SQLite busy; retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

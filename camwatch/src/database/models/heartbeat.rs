//! Heartbeat models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::probe::{ProbeOutcome, ProbeResult};
use crate::registry::Protocol;
use crate::{Error, Result};

/// Row of a per-stream history table.
#[derive(Debug, Clone, FromRow)]
pub struct HeartbeatDbModel {
    pub id: i64,
    pub stream_name: String,
    /// Epoch milliseconds (UTC).
    pub observed_at: i64,
    pub outcome: String,
    pub latency_ms: i64,
    pub message: String,
}

/// Persisted projection of a probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub stream_name: String,
    pub protocol: Protocol,
    pub observed_at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
    pub latency_ms: i64,
    pub message: String,
}

impl HeartbeatRecord {
    pub fn observed_at_ms(&self) -> i64 {
        datetime_to_ms(self.observed_at)
    }

    pub(crate) fn from_row(row: HeartbeatDbModel, protocol: Protocol) -> Result<Self> {
        let outcome = row.outcome.parse::<ProbeOutcome>().map_err(|_| {
            Error::CorruptHistory(format!(
                "unknown outcome '{}' in history of {}",
                row.outcome, row.stream_name
            ))
        })?;
        Ok(Self {
            stream_name: row.stream_name,
            protocol,
            observed_at: ms_to_datetime(row.observed_at),
            outcome,
            latency_ms: row.latency_ms,
            message: row.message,
        })
    }
}

impl From<&ProbeResult> for HeartbeatRecord {
    fn from(result: &ProbeResult) -> Self {
        Self {
            stream_name: result.stream_name.clone(),
            protocol: result.protocol,
            observed_at: result.observed_at,
            outcome: result.outcome,
            latency_ms: result.latency_ms() as i64,
            message: result.message.clone(),
        }
    }
}

/// Time range and size limit for history reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub to: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            limit: 500,
        }
    }
}

/// History table name for a stream.
///
/// Characters outside `[A-Za-z0-9_]` become `_`; names that would not start
/// with a letter or underscore get a `t_` prefix.
pub fn history_table_name(stream_name: &str) -> String {
    let safe: String = stream_name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    match safe.chars().next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => format!("log_{safe}"),
        _ => format!("log_t_{safe}"),
    }
}

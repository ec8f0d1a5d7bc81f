//! Protocol probers.
//!
//! A [`Prober`] performs one bounded liveness check and always produces a
//! [`ProbeResult`]; failures are outcomes, never errors.

pub mod poll_image;
pub mod pull_stream;

pub use poll_image::{PollImageConfig, PollImageProber};
pub use pull_stream::{PullStreamConfig, PullStreamProber};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::registry::Protocol;

/// Classified result of a probe.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    Timeout,
    ConnectionRefused,
    AuthFailure,
    ProtocolError,
    PayloadInvalid,
}

impl ProbeOutcome {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success)
    }
}

/// Everything a prober needs for one check.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub stream_name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub timeout: Duration,
}

/// Immutable result of one probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub stream_name: String,
    pub protocol: Protocol,
    pub outcome: ProbeOutcome,
    pub latency: Duration,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn new(
        request: &ProbeRequest,
        outcome: ProbeOutcome,
        latency: Duration,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stream_name: request.stream_name.clone(),
            protocol: request.protocol,
            outcome,
            latency,
            message: message.into(),
            observed_at: Utc::now(),
        }
    }

    /// Result for a probe that ran out of budget.
    pub fn timed_out(request: &ProbeRequest, elapsed: Duration) -> Self {
        Self::new(
            request,
            ProbeOutcome::Timeout,
            elapsed,
            format!("no answer within {} ms", request.timeout.as_millis()),
        )
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis().min(u64::MAX as u128) as u64
    }
}

/// Failure detail produced inside a prober before it becomes a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub outcome: ProbeOutcome,
    pub message: String,
}

impl ProbeFailure {
    pub fn new(outcome: ProbeOutcome, message: impl Into<String>) -> Self {
        Self {
            outcome,
            message: message.into(),
        }
    }
}

/// Liveness check for one protocol family.
///
/// Implementations are stateless across calls and safe to share between
/// concurrent probes of different streams.
#[async_trait]
pub trait Prober: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Check the endpoint. Must return within `request.timeout`.
    async fn probe(&self, request: &ProbeRequest) -> ProbeResult;
}

/// Run a check under the request's timeout and convert it into a result.
///
/// Dropping the check future on timeout closes whatever socket it holds.
pub(crate) async fn bounded<F>(request: &ProbeRequest, check: F) -> ProbeResult
where
    F: Future<Output = Result<String, ProbeFailure>>,
{
    let started = Instant::now();
    match tokio::time::timeout(request.timeout, check).await {
        Ok(Ok(message)) => {
            ProbeResult::new(request, ProbeOutcome::Success, started.elapsed(), message)
        }
        Ok(Err(failure)) => ProbeResult::new(
            request,
            failure.outcome,
            started.elapsed(),
            failure.message,
        ),
        Err(_) => ProbeResult::timed_out(request, started.elapsed()),
    }
}

/// One prober per protocol, chosen once per stream when the registry loads.
#[derive(Clone)]
pub struct ProberSet {
    pub pull_stream: Arc<dyn Prober>,
    pub poll_image: Arc<dyn Prober>,
}

impl ProberSet {
    pub fn new(pull_stream: Arc<dyn Prober>, poll_image: Arc<dyn Prober>) -> Self {
        Self {
            pull_stream,
            poll_image,
        }
    }

    /// Real network probers.
    pub fn network(
        pull: PullStreamConfig,
        poll: PollImageConfig,
    ) -> crate::Result<Self> {
        Ok(Self::new(
            Arc::new(PullStreamProber::new(pull)),
            Arc::new(PollImageProber::new(poll)?),
        ))
    }

    pub fn for_protocol(&self, protocol: Protocol) -> Arc<dyn Prober> {
        match protocol {
            Protocol::PullStream => self.pull_stream.clone(),
            Protocol::PollImage => self.poll_image.clone(),
        }
    }
}

impl std::fmt::Debug for ProberSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProberSet").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(timeout: Duration) -> ProbeRequest {
        ProbeRequest {
            stream_name: "cam".to_string(),
            protocol: Protocol::PullStream,
            endpoint: "rtsp://cam/live".to_string(),
            timeout,
        }
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(ProbeOutcome::ConnectionRefused.to_string(), "connection_refused");
        assert_eq!(
            "payload_invalid".parse::<ProbeOutcome>().unwrap(),
            ProbeOutcome::PayloadInvalid
        );
        assert_eq!(
            serde_json::to_string(&ProbeOutcome::AuthFailure).unwrap(),
            "\"auth_failure\""
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let req = request(Duration::from_secs(2));
        let result = bounded(&req, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("late".to_string())
        })
        .await;
        assert_eq!(result.outcome, ProbeOutcome::Timeout);
        assert_eq!(result.latency, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_passes_failure_through() {
        let req = request(Duration::from_secs(2));
        let result = bounded(&req, async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Err(ProbeFailure::new(ProbeOutcome::AuthFailure, "RTSP 401"))
        })
        .await;
        assert_eq!(result.outcome, ProbeOutcome::AuthFailure);
        assert_eq!(result.message, "RTSP 401");
        assert_eq!(result.latency_ms(), 120);
    }
}

//! RTSP liveness check.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use rtsp::RtspError;
use rtsp::client::{SessionConfig, check_stream};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ProbeFailure, ProbeOutcome, ProbeRequest, ProbeResult, Prober, bounded};
use crate::registry::Protocol;

/// Pull-stream prober settings (`[engine.pull_stream]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullStreamConfig {
    /// Budget for the whole session, connect through first media unit.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// When false the check stops after a successful `DESCRIBE`.
    #[serde(default = "default_true")]
    pub require_media: bool,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_user_agent() -> String {
    concat!("camwatch/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for PullStreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            require_media: true,
            user_agent: default_user_agent(),
        }
    }
}

impl PullStreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

pub struct PullStreamProber {
    config: PullStreamConfig,
}

impl PullStreamProber {
    pub fn new(config: PullStreamConfig) -> Self {
        Self { config }
    }

    async fn check(&self, endpoint: &str) -> Result<String, ProbeFailure> {
        let url = rtsp::RtspUrl::parse(endpoint).map_err(classify)?;
        let session_config = SessionConfig {
            user_agent: self.config.user_agent.clone(),
        };
        let check = check_stream(url, session_config, self.config.require_media)
            .await
            .map_err(classify)?;

        Ok(match check.first_unit {
            Some(unit) => format!(
                "first RTP packet on channel {} ({} payload bytes, pt {})",
                unit.channel, unit.header.payload_len, unit.header.payload_type
            ),
            None => "DESCRIBE succeeded".to_string(),
        })
    }
}

#[async_trait]
impl Prober for PullStreamProber {
    fn protocol(&self) -> Protocol {
        Protocol::PullStream
    }

    async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
        let result = bounded(request, self.check(&request.endpoint)).await;
        debug!(
            stream = %request.stream_name,
            outcome = %result.outcome,
            latency_ms = result.latency_ms(),
            "rtsp probe finished"
        );
        result
    }
}

/// Map a session error onto a probe outcome.
fn classify(err: RtspError) -> ProbeFailure {
    let outcome = match &err {
        RtspError::Connect(_) => ProbeOutcome::ConnectionRefused,
        RtspError::Io(io) if is_socket_failure(io.kind()) => ProbeOutcome::ConnectionRefused,
        RtspError::Unauthorized { .. } => ProbeOutcome::AuthFailure,
        RtspError::Status { code, reason, .. } => {
            return ProbeFailure::new(ProbeOutcome::ProtocolError, format!("RTSP {code} {reason}"));
        }
        RtspError::Closed => {
            return ProbeFailure::new(
                ProbeOutcome::ProtocolError,
                "session ended before the first media unit",
            );
        }
        RtspError::InvalidUrl(_)
        | RtspError::Io(_)
        | RtspError::Malformed(_)
        | RtspError::UnsupportedAuth(_)
        | RtspError::NoVideoTrack
        | RtspError::InvalidRtp(_) => ProbeOutcome::ProtocolError,
    };
    ProbeFailure::new(outcome, err.to_string())
}

fn is_socket_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
    )
}

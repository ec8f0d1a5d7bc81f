use std::io;

use thiserror::Error;

/// Errors produced while talking to an RTSP server.
#[derive(Error, Debug)]
pub enum RtspError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by server")]
    Closed,

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected status {code} {reason} for {method}")]
    Status {
        method: &'static str,
        code: u16,
        reason: String,
    },

    #[error("authentication rejected ({code})")]
    Unauthorized { code: u16 },

    #[error("unsupported authentication scheme: {0}")]
    UnsupportedAuth(String),

    #[error("no media track in session description")]
    NoVideoTrack,

    #[error("invalid rtp packet: {0}")]
    InvalidRtp(String),
}

impl RtspError {
    /// Whether the server refused the credentials (or none were supplied).
    pub fn is_auth(&self) -> bool {
        matches!(self, RtspError::Unauthorized { .. })
    }

    /// Whether the failure happened before any RTSP exchange took place.
    pub fn is_connect(&self) -> bool {
        matches!(self, RtspError::Connect(_))
    }
}

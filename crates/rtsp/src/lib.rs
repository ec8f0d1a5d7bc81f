//! Minimal RTSP/1.0 client.
//!
//! Only the subset needed to prove that a camera serves live media is
//! implemented: `OPTIONS`, `DESCRIBE`, `SETUP` with TCP interleaved
//! transport, `PLAY` and `TEARDOWN`, plus Basic and Digest authentication.
//! Frames are read until the first RTP packet arrives; nothing is decoded.

pub mod auth;
pub mod client;
pub mod error;
pub mod message;
pub mod rtp;
pub mod sdp;
pub mod url;

pub use client::{RtspSession, SessionConfig};
pub use error::RtspError;
pub use message::{InterleavedFrame, Method, Request, Response};
pub use url::RtspUrl;

/// Default RTSP port when the URL does not carry one.
pub const DEFAULT_PORT: u16 = 554;

/// Result type for RTSP operations.
pub type Result<T> = std::result::Result<T, RtspError>;

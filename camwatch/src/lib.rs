//! camwatch: adaptive liveness monitoring for a fleet of video cameras.
//!
//! The engine probes RTSP streams and HTTP snapshot endpoints on an adaptive
//! schedule, persists every outcome as a heartbeat and keeps an in-memory
//! status snapshot for consumers.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod panic_hook;
pub mod probe;
pub mod registry;
pub mod scheduler;
pub mod services;
pub mod status;
pub mod utils;

pub use error::{Error, Result};

//! Database models.

pub mod heartbeat;

pub use heartbeat::*;

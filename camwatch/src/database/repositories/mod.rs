//! Repository layer for database access.

pub mod heartbeat;

pub use heartbeat::*;

//! Read-only HTTP API over the status snapshot, the registry and the
//! heartbeat history.

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, AppState};

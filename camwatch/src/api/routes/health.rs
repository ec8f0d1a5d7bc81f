//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;

use crate::api::server::AppState;
use crate::scheduler::SchedulerStatsSnapshot;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub streams: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerStatsSnapshot>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        streams: state.registry.snapshot().len(),
        scheduler: state.scheduler_stats.as_ref().map(|s| s.snapshot()),
    })
}

/// Liveness check - is the service alive?
async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::test_support;
    use crate::registry::StreamEntry;
    use crate::scheduler::SchedulerStats;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_health_reports_streams_and_stats() {
        let state = test_support::state().with_scheduler_stats(Arc::new(SchedulerStats::default()));
        state
            .registry
            .load(&[StreamEntry::new("lobby", "rtsp://10.0.0.1/live")]);

        let (status, body) = test_support::get(state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["streams"], 1);
        assert_eq!(body["scheduler"]["in_flight"], 0);
    }

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = test_support::get(test_support::state(), "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }
}

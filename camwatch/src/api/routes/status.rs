//! Status snapshot routes.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::status::StatusView;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_status))
        .route("/{name}", get(get_status))
}

/// Latest outcome per stream. Streams never probed are absent.
async fn list_status(State(state): State<AppState>) -> Json<BTreeMap<String, StatusView>> {
    Json(state.aggregator.render(state.timezone))
}

async fn get_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StatusView>> {
    let entry = state
        .aggregator
        .get(&name)
        .ok_or_else(|| ApiError::not_found(format!("no status for stream '{}'", name)))?;
    Ok(Json(StatusView::render(&entry, state.timezone)))
}

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, routing::get, Json, Router};

use moodscope_infra::Orchestrator;

use crate::app::errors;

pub fn router() -> Router {
    Router::new().route("/queues", get(queue_overview))
}

/// Per-category queue depth and job counts by status.
pub async fn queue_overview(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
) -> axum::response::Response {
    match orchestrator.queue_overview().await {
        Ok(overview) => (StatusCode::OK, Json(overview)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

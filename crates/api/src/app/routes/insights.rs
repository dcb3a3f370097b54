use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value as JsonValue;

use moodscope_core::{InsightId, UserId};
use moodscope_infra::jobs::JobCategory;
use moodscope_infra::Orchestrator;

use crate::app::routes::jobs::accepted;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_generation))
        .route("/:id", get(get_insight))
}

/// Per-user listing, mounted at the root next to the snapshot listing.
pub fn user_router() -> Router {
    Router::new().route("/users/:id/insights", get(list_user_insights))
}

/// Body: `{snapshot_id, category, tone?}`.
pub async fn submit_generation(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> axum::response::Response {
    let body = match dto::json_body(body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match orchestrator.submit(JobCategory::Generation, &body).await {
        Ok(job_id) => accepted(job_id),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_insight(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let insight_id = match dto::parse_path::<InsightId>(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match orchestrator.get_insight(insight_id).await {
        Ok(insight) => (StatusCode::OK, Json(insight)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn list_user_insights(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Query(query): Query<dto::InsightListQuery>,
) -> axum::response::Response {
    let user_id = match dto::parse_path::<UserId>(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let filter = match query.parse() {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    match orchestrator
        .list_insights(user_id, filter.category, filter.limit)
        .await
    {
        Ok(insights) => (StatusCode::OK, Json(insights)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

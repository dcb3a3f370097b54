use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use moodscope_infra::jobs::{JobCategory, JobId, JobState};
use moodscope_infra::Orchestrator;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/:id", get(get_job))
}

pub fn accepted(job_id: JobId) -> axum::response::Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id.to_string() })),
    )
        .into_response()
}

pub async fn submit_job(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    body: Result<Json<dto::SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let body = match dto::json_body(body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    let category = match dto::parse_path::<JobCategory>(&body.category) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    match orchestrator.submit(category, &body.payload).await {
        Ok(job_id) => accepted(job_id),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_path::<JobId>(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match orchestrator.get_job_status(job_id).await {
        Ok(view) if view.state == JobState::NotFound => (StatusCode::NOT_FOUND, Json(view)).into_response(),
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

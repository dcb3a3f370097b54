use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    routing::post,
    Json, Router,
};
use serde_json::Value as JsonValue;

use moodscope_infra::jobs::JobCategory;
use moodscope_infra::Orchestrator;

use crate::app::routes::jobs::accepted;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/", post(submit_ingestion))
}

/// Body: `{user_id, time_range?}`.
pub async fn submit_ingestion(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    body: Result<Json<JsonValue>, JsonRejection>,
) -> axum::response::Response {
    let body = match dto::json_body(body) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    match orchestrator.submit(JobCategory::Ingestion, &body).await {
        Ok(job_id) => accepted(job_id),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use moodscope_core::DomainError;
use moodscope_infra::OrchestratorError;

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        OrchestratorError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        OrchestratorError::QueueUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", msg)
        }
        OrchestratorError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", msg),
        OrchestratorError::Config(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "config_error", e.to_string()),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        other => json_error(StatusCode::BAD_REQUEST, "validation_error", other.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

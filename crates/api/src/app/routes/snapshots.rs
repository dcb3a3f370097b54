use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use moodscope_core::{SnapshotId, UserId};
use moodscope_infra::Orchestrator;

use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/users/:id/snapshots", get(list_user_snapshots))
        .route("/snapshots/:id", get(get_snapshot))
}

pub async fn list_user_snapshots(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
    Query(query): Query<dto::SnapshotListQuery>,
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
        .list_snapshots(user_id, filter.time_range, filter.limit)
        .await
    {
        Ok(snapshots) => (StatusCode::OK, Json(snapshots)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_snapshot(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let snapshot_id = match dto::parse_path::<SnapshotId>(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match orchestrator.get_snapshot(snapshot_id).await {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

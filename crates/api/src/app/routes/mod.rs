use axum::Router;

pub mod admin;
pub mod ingestions;
pub mod insights;
pub mod jobs;
pub mod snapshots;
pub mod system;

/// Router for all resource endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/ingestions", ingestions::router())
        .nest("/insights", insights::router())
        .merge(snapshots::router())
        .merge(insights::user_router())
        .nest("/admin", admin::router())
}

use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::submit))
        .route("/submissions/:job_id", get(handlers::get_submission))
        .route("/jobs/:job_id", delete(handlers::cancel_job))
        .route("/healthz", get(handlers::health_check))
        .route("/metrics", get(handlers::serve_metrics))
}

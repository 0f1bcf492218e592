// Route table of the builder HTTP surface

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/build/new", post(handlers::register_build))
        .route("/api/v1/build/status/:uuid", get(handlers::build_status))
        .route("/api/v1/build/report/:uuid", get(handlers::build_report))
        .route("/api/v1/build/:uuid", get(handlers::build_status))
        .route("/api/v1/commit/:uuid/report", get(handlers::build_report))
        .route("/api/v1/testcase/new", post(handlers::register_test_case))
        .route("/api/v1/testcase/create", post(handlers::register_test_case))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}

// Prometheus metrics for the worker, served next to a health check.

use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::error;

lazy_static! {
    pub static ref BUILDS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "psjudge_builds_finished_total",
        "Builds finalized by this worker, by terminal status",
        &["status"]
    )
    .expect("metric can be registered");
    pub static ref DUPLICATE_DELIVERIES: IntCounter = register_int_counter!(
        "psjudge_duplicate_deliveries_total",
        "Deliveries dropped because the build was already claimed or finished"
    )
    .expect("metric can be registered");
    pub static ref BUSY_SLOTS: IntGauge = register_int_gauge!(
        "psjudge_busy_slots",
        "Worker slots currently running a build"
    )
    .expect("metric can be registered");
    pub static ref PIPELINE_DURATION: Histogram = register_histogram!(
        "psjudge_pipeline_duration_seconds",
        "Wall time from claim to finalize",
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    )
    .expect("metric can be registered");
    pub static ref STALE_RESETS: IntCounter = register_int_counter!(
        "psjudge_stale_resets_total",
        "Running builds reset to pending by the reaper"
    )
    .expect("metric can be registered");
}

async fn metrics_handler() -> impl IntoResponse {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_check))
}

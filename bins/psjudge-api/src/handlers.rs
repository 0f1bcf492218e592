// HTTP route handlers for the psjudge API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use psjudge_common::api::{
    BuildReportResponse, BuildStatusResponse, ErrorResponse, RegisterBuildRequest,
    RegisterResponse, RegisterTestCaseRequest,
};
use psjudge_common::store::Registration;
use psjudge_common::types::{BuildJob, BuildStatus};
use psjudge_common::JudgeError;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics::{self, REGISTRATIONS};
use crate::AppState;

/// Every error leaves the api as `{"error": {"text": ...}}`.
#[derive(Debug)]
pub struct ApiError(JudgeError);

impl From<JudgeError> for ApiError {
    fn from(err: JudgeError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(JudgeError::InvalidSubmission(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            JudgeError::InvalidSubmission(_) => StatusCode::BAD_REQUEST,
            JudgeError::NotFound(_) => StatusCode::NOT_FOUND,
            JudgeError::Conflict(_) => StatusCode::CONFLICT,
            JudgeError::Config(_)
            | JudgeError::Storage(_)
            | JudgeError::Serialization(_)
            | JudgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(ErrorResponse::new(self.0.to_string()))).into_response()
    }
}

async fn load_build(state: &AppState, uuid: &str) -> Result<BuildJob, ApiError> {
    state
        .store
        .build(uuid)
        .await?
        .ok_or_else(|| ApiError(JudgeError::NotFound(format!("build '{}' not found", uuid))))
}

/// POST /api/v1/build/new - Register a build and queue it
pub async fn register_build(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterBuildRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(request) = payload?;
    let job = request.into_job()?;

    match state.store.register_build(&job).await {
        Ok(Registration::Created) => {
            state.queue.publish(&job.uuid).await?;
            REGISTRATIONS.with_label_values(&["build", "created"]).inc();
            info!(
                uuid = %job.uuid,
                assignment_uuid = %job.assignment_uuid,
                language = %job.language,
                source_size = job.source.len(),
                "Build queued"
            );
        }
        Ok(Registration::AlreadyExists) => {
            REGISTRATIONS.with_label_values(&["build", "duplicate"]).inc();
            // A publish lost after the insert is healed by the client's retry
            let stored = load_build(&state, &job.uuid).await?;
            if stored.status == BuildStatus::Pending {
                state.queue.publish(&job.uuid).await?;
            }
            info!(uuid = %job.uuid, status = %stored.status, "Build already registered");
        }
        Err(e) => {
            if matches!(e, JudgeError::Conflict(_)) {
                REGISTRATIONS.with_label_values(&["build", "conflict"]).inc();
                warn!(uuid = %job.uuid, "Build uuid reused with different content");
            }
            return Err(e.into());
        }
    }

    Ok(Json(RegisterResponse { uuid: job.uuid }))
}

/// GET /api/v1/build/status/{uuid} and /api/v1/build/{uuid}
pub async fn build_status(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<Json<BuildStatusResponse>, ApiError> {
    let job = load_build(&state, &uuid).await?;
    Ok(Json(BuildStatusResponse::from(&job)))
}

/// GET /api/v1/build/report/{uuid} and /api/v1/commit/{uuid}/report
pub async fn build_report(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> Result<Json<BuildReportResponse>, ApiError> {
    let job = load_build(&state, &uuid).await?;
    Ok(Json(BuildReportResponse::from(&job)))
}

/// POST /api/v1/testcase/new and /api/v1/testcase/create
pub async fn register_test_case(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterTestCaseRequest>, JsonRejection>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let Json(request) = payload?;
    let case = request.into_test_case()?;

    let outcome = match state.store.register_test_case(&case).await? {
        Registration::Created => "created",
        Registration::AlreadyExists => "duplicate",
    };
    REGISTRATIONS.with_label_values(&["testcase", outcome]).inc();
    info!(
        uuid = %case.uuid,
        assignment_uuid = %case.assignment_uuid,
        input_size = case.input.len(),
        outcome,
        "Test case registered"
    );

    Ok(Json(RegisterResponse { uuid: case.uuid }))
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render() {
        Some(body) => (StatusCode::OK, body),
        None => (StatusCode::INTERNAL_SERVER_ERROR, String::new()),
    }
}

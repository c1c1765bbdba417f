use std::net::SocketAddr;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::driver::{Action, PrinterState, Telemetry};
use crate::error::BedloopError;
use crate::node::DriverHandle;
use crate::storage::JobManifest;

#[derive(Clone)]
pub struct DashboardState {
    pub handle: DriverHandle,
}

impl DashboardState {
    pub fn new(handle: DriverHandle) -> Self {
        Self { handle }
    }
}

#[derive(Deserialize)]
struct ActionRequest {
    action: Action,
    printer: PrinterState,
    #[serde(flatten)]
    telemetry: Telemetry,
}

#[derive(Deserialize)]
struct JobsRequest {
    queue: String,
    ids: Vec<Uuid>,
}

#[derive(Serialize)]
struct JobsResponse {
    success: bool,
    count: usize,
    error: Option<String>,
}

#[derive(Deserialize)]
struct ImportRequest {
    queue: String,
    manifest: JobManifest,
}

/// Reply to `POST /api/jobs/import`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ImportResponse {
    pub success: bool,
    pub job_id: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// The dashboard API, without binding a socket.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/action", post(action_handler))
        .route("/api/jobs/reset", post(reset_jobs_handler))
        .route("/api/jobs/remove", post(remove_jobs_handler))
        .route("/api/jobs/import", post(import_job_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

fn unavailable(e: BedloopError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

async fn state_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.handle.state().await {
        Ok(node) => (StatusCode::OK, Json(node)).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}

async fn action_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<ActionRequest>,
) -> impl IntoResponse {
    match state
        .handle
        .action(payload.action, payload.printer, payload.telemetry)
        .await
    {
        Ok(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}

async fn reset_jobs_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<JobsRequest>,
) -> impl IntoResponse {
    jobs_response(state.handle.reset_jobs(payload.queue, payload.ids).await)
}

async fn remove_jobs_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<JobsRequest>,
) -> impl IntoResponse {
    jobs_response(state.handle.remove_jobs(payload.queue, payload.ids).await)
}

async fn import_job_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<ImportRequest>,
) -> impl IntoResponse {
    match state.handle.import_job(payload.queue, payload.manifest).await {
        Ok(job_id) => (
            StatusCode::OK,
            Json(ImportResponse {
                success: true,
                job_id: Some(job_id),
                error: None,
            }),
        ),
        Err(e) => (
            error_status(&e),
            Json(ImportResponse {
                success: false,
                job_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}

fn error_status(e: &BedloopError) -> StatusCode {
    match e {
        BedloopError::QueueNotFound(_) => StatusCode::NOT_FOUND,
        BedloopError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn jobs_response(result: crate::error::Result<usize>) -> (StatusCode, Json<JobsResponse>) {
    match result {
        Ok(count) => (
            StatusCode::OK,
            Json(JobsResponse {
                success: true,
                count,
                error: None,
            }),
        ),
        Err(e) => (
            error_status(&e),
            Json(JobsResponse {
                success: false,
                count: 0,
                error: Some(e.to_string()),
            }),
        ),
    }
}

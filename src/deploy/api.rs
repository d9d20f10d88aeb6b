use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;

use hostdeck_common::{DeployRequest, Rejection, RunId, RunSnapshot, StepId};

use super::pipeline::Orchestrator;
use super::ws;
use crate::errors::DeployError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Response payload types ────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployAccepted {
    pub run_id: RunId,
    pub slot: String,
    pub steps: Vec<StepId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSlot {
    pub slot: String,
    pub run_id: RunId,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Rejected(Rejection),
}

impl From<DeployError> for ApiError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::RunNotFound { .. } => ApiError::NotFound(err.to_string()),
            DeployError::NotRunning { .. } => ApiError::Conflict(err.to_string()),
        }
    }
}

/// HTTP status for a synchronous deploy rejection.
pub fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::SlotOccupied { .. } => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "run-not-found", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "not-running", msg),
            ApiError::Rejected(rejection) => (
                rejection_status(&rejection),
                rejection.code(),
                rejection.to_string(),
            ),
        };
        (
            status,
            Json(serde_json::json!({"error": code, "message": message})),
        )
            .into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/deploy", post(start_deploy))
        .route("/api/deploy/stream", get(ws::deploy_stream_handler))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/events", get(ws::run_events_handler))
        .route("/api/slots", get(list_slots))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn start_deploy(
    State(state): State<SharedState>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .orchestrator
        .start(&request)
        .map_err(ApiError::Rejected)?;
    let accepted = DeployAccepted {
        run_id: run.id(),
        slot: run.slot().to_string(),
        steps: run.step_ids(),
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn list_runs(State(state): State<SharedState>) -> Json<Vec<RunSnapshot>> {
    Json(state.orchestrator.list().iter().map(|r| r.snapshot()).collect())
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<RunId>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let run = state
        .orchestrator
        .get(id)
        .ok_or(DeployError::RunNotFound { id })?;
    Ok(Json(run.snapshot()))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<RunId>,
) -> Result<Json<RunSnapshot>, ApiError> {
    let run = state.orchestrator.cancel(id)?;
    Ok(Json(run.snapshot()))
}

async fn list_slots(State(state): State<SharedState>) -> Json<Vec<ActiveSlot>> {
    Json(
        state
            .orchestrator
            .active_slots()
            .into_iter()
            .map(|(slot, run_id)| ActiveSlot { slot, run_id })
            .collect(),
    )
}

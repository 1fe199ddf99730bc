//! HTTP route handlers for the run control API.

use std::path::PathBuf;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

use storyloop::core::budget::BudgetConfig;
use storyloop::core::types::{Run, RunFilter, RunStatus, RunSummary};
use storyloop::io::backlog::BacklogRef;
use storyloop::orchestrator::{ControlError, StartRunRequest};

use crate::sse;
use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/runs", get(list_runs).post(start_run))
        .route("/runs/{run_id}", get(get_run).delete(archive_run))
        .route("/runs/{run_id}/pause", post(pause_run))
        .route("/runs/{run_id}/resume", post(resume_run))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/runs/{run_id}/events", get(sse::events_handler))
}

/// Error response: control errors keep their meaning, everything else is a 500.
pub struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<ControlError>() {
            Some(ControlError::RunNotFound(_)) => StatusCode::NOT_FOUND,
            Some(ControlError::InvalidTransition { .. } | ControlError::BacklogInUse { .. }) => {
                StatusCode::CONFLICT
            }
            Some(ControlError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            None => {
                error!(err = %format!("{:#}", self.0), "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": format!("{:#}", self.0) }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(ControlError::InvalidRequest(message.into()).into())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRunBody {
    project_id: String,
    #[serde(default)]
    backlog_path: Option<PathBuf>,
    #[serde(default)]
    backlog: Option<Value>,
    #[serde(default)]
    source_id: Option<String>,
    budget: BudgetConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRunResponse {
    run_id: String,
}

/// POST /api/runs - start a run from a backlog file or an inline document.
async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunBody>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    let backlog = match (body.backlog_path, body.backlog) {
        (Some(path), None) => BacklogRef::Path(path),
        (None, Some(document)) => BacklogRef::Inline {
            source_id: body.source_id.unwrap_or_default(),
            document,
        },
        _ => return Err(bad_request("exactly one of backlogPath or backlog is required")),
    };
    let run_id = state
        .orchestrator
        .start_run(StartRunRequest {
            project_id: body.project_id,
            backlog,
            budget: body.budget,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(StartRunResponse { run_id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    project_id: Option<String>,
    status: Option<String>,
    #[serde(default)]
    active_only: bool,
}

/// GET /api/runs - run summaries, oldest first.
async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<RunSummary>>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            RunStatus::parse(raw).ok_or_else(|| bad_request(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let filter = RunFilter {
        status,
        active_only: query.active_only,
    };
    let runs = state
        .orchestrator
        .list_runs(query.project_id.as_deref(), &filter)
        .await?;
    Ok(Json(runs))
}

/// GET /api/runs/{run_id} - latest snapshot.
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.orchestrator.get_run(&run_id).await?))
}

async fn pause_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.pause_run(&run_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn resume_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.resume_run(&run_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.cancel_run(&run_id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// DELETE /api/runs/{run_id} - archive a terminal run.
async fn archive_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.archive_run(&run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

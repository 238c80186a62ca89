use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::run::{Run, RunId, RunStatus, RunnableKind};
use crate::store::RunFilter;

use super::{auth, logs, results, ApiError, AppState};

/// Request body for `POST /runs`.
///
/// `runnable_type` is carried as a string and validated in the handler so
/// a bad value gets the standard `{error, code}` body instead of the raw
/// deserialization rejection.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub runnable_id: Uuid,
    pub runnable_type: String,
    #[serde(default)]
    pub input_variables: serde_json::Map<String, Value>,
}

/// Query parameters for `GET /runs`.
#[derive(Debug, Default, Deserialize)]
pub struct ListRunsQuery {
    pub runnable_id: Option<Uuid>,
    pub status: Option<RunStatus>,
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/stream", get(results::stream_results))
        .route("/ws/runs/{id}/logs", get(logs::stream_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    let app = Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(health_check));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "ok"
}

#[cfg(feature = "metrics")]
async fn metrics_handler() -> Result<String, ApiError> {
    crate::metrics::gather_metrics()
        .map_err(|_| ApiError::Internal("metrics gathering failed".to_string()))
}

/// Start a new run for an agent or team.
///
/// Returns 201 with the run record once the worker is scheduled; the record
/// is `running` in the common case and `pending` if the worker won the race
/// to its own status stamp first.
async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let kind: RunnableKind = req
        .runnable_type
        .parse()
        .map_err(ApiError::BadRequest)?;
    let run = state
        .coordinator
        .start(kind, req.runnable_id, req.input_variables)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// List runs, optionally filtered by runnable and status. Newest first.
async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let runs = state
        .store
        .list(RunFilter {
            runnable_id: query.runnable_id,
            status: query.status,
        })
        .await?;
    Ok(Json(runs))
}

/// Fetch a single run.
async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    let run = state.store.fetch(RunId(id)).await?;
    Ok(Json(run))
}

/// Attempt to cancel a run; returns the record after the attempt.
async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Run>, ApiError> {
    let run = state.coordinator.cancel(RunId(id)).await?;
    Ok(Json(run))
}

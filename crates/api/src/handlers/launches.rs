//! The remote worker protocol: claim, start, heartbeat, report.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use engine::{CompletionReport, FWorker, Firework, Launch, LaunchId, RuntimeInfo, Tracker};
use serde::Deserialize;
use tasks::FwAction;

use crate::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct ReservationDto {
    pub reservation_id: String,
}

/// 200 with the claim, or 204 when nothing matches the worker.
pub async fn claim(
    State(state): State<AppState>,
    Json(worker): Json<FWorker>,
) -> Result<Response, ApiError> {
    match state.engine.claim(&worker).await? {
        Some(claim) => Ok(Json(claim).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

pub async fn get(
    Path(id): Path<LaunchId>,
    State(state): State<AppState>,
) -> Result<Json<Launch>, ApiError> {
    state
        .engine
        .launch(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("launch {id} not found")))
}

pub async fn running(
    Path(id): Path<LaunchId>,
    State(state): State<AppState>,
    Json(runtime): Json<RuntimeInfo>,
) -> Result<Json<Firework>, ApiError> {
    Ok(Json(state.engine.mark_running(id, runtime).await?))
}

pub async fn ping(
    Path(id): Path<LaunchId>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.engine.ping(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reservation(
    Path(id): Path<LaunchId>,
    State(state): State<AppState>,
    Json(payload): Json<ReservationDto>,
) -> Result<StatusCode, ApiError> {
    state.engine.set_reservation_id(id, payload.reservation_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn trackers(
    Path(id): Path<LaunchId>,
    State(state): State<AppState>,
    Json(trackers): Json<Vec<Tracker>>,
) -> Result<StatusCode, ApiError> {
    state.engine.update_trackers(id, trackers).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn complete(
    Path(id): Path<LaunchId>,
    State(state): State<AppState>,
    Json(action): Json<FwAction>,
) -> Result<Json<CompletionReport>, ApiError> {
    Ok(Json(state.engine.complete_launch(id, action).await?))
}

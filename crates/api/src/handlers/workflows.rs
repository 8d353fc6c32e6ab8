use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use engine::{FwId, Insertion, StalledBranch, Submitted, WfId, Workflow, WorkflowSpec};
use serde::Serialize;
use serde_json::Value;

use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct DefusedDto {
    pub defused: usize,
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<WfId>> {
    Json(state.engine.workflow_ids().await)
}

/// Accepts a workflow document or a bare firework.
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<(StatusCode, Json<Submitted>), ApiError> {
    let spec = WorkflowSpec::from_value(&payload).map_err(|e| ApiError::bad_request(e.to_string()))?;
    let submitted = state.engine.submit(spec).await?;
    Ok((StatusCode::CREATED, Json(submitted)))
}

pub async fn get(
    Path(id): Path<WfId>,
    State(state): State<AppState>,
) -> Result<Json<Workflow>, ApiError> {
    state
        .engine
        .workflow(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("workflow {id} not found")))
}

pub async fn insert(
    Path(id): Path<WfId>,
    State(state): State<AppState>,
    Json(payload): Json<Insertion>,
) -> Result<Json<BTreeMap<FwId, FwId>>, ApiError> {
    Ok(Json(state.engine.insert_workflow(id, payload).await?))
}

pub async fn defuse(
    Path(id): Path<WfId>,
    State(state): State<AppState>,
) -> Result<Json<DefusedDto>, ApiError> {
    let defused = state.engine.defuse_workflow(id).await?;
    Ok(Json(DefusedDto { defused }))
}

pub async fn stalled(
    Path(id): Path<WfId>,
    State(state): State<AppState>,
) -> Result<Json<Vec<StalledBranch>>, ApiError> {
    Ok(Json(state.engine.stalled_branches(id).await?))
}

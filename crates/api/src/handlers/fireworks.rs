use axum::{
    extract::{Path, State},
    Json,
};
use engine::{Firework, FwId, FwState};
use serde::{Deserialize, Serialize};

use crate::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct CommandResultDto {
    pub fw_id: FwId,
    pub state: FwState,
    /// False when the firework was already in the requested state.
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct PriorityDto {
    pub priority: f64,
}

pub async fn get(
    Path(id): Path<FwId>,
    State(state): State<AppState>,
) -> Result<Json<Firework>, ApiError> {
    state
        .engine
        .firework(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("firework {id} not found")))
}

/// `POST /fireworks/:id/:command` for the operator commands.
pub async fn command(
    Path((id, command)): Path<(FwId, String)>,
    State(state): State<AppState>,
) -> Result<Json<CommandResultDto>, ApiError> {
    let engine = &state.engine;
    let changed = match command.as_str() {
        "rerun" => engine.rerun(id).await.map(|()| true)?,
        "defuse" => engine.defuse(id).await?,
        "pause" => engine.pause(id).await?,
        "resume" => engine.resume(id).await?,
        "reignite" => engine.reignite(id).await?,
        "archive" => engine.archive(id).await?,
        other => return Err(ApiError::not_found(format!("unknown command '{other}'"))),
    };
    let fw = engine
        .firework(id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("firework {id} not found")))?;
    Ok(Json(CommandResultDto {
        fw_id: id,
        state: fw.state,
        changed,
    }))
}

pub async fn priority(
    Path(id): Path<FwId>,
    State(state): State<AppState>,
    Json(payload): Json<PriorityDto>,
) -> Result<Json<Firework>, ApiError> {
    state.engine.set_priority(id, payload.priority).await?;
    get(Path(id), State(state)).await
}

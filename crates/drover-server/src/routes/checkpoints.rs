//! Checkpoint endpoints: detail, decisions, rollback, rollback preview.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use drover_core::checkpoint::{self, DecisionRequest};
use drover_db::models::UserDecision;
use drover_db::queries::checkpoints as checkpoint_db;
use drover_db::queries::corrections as correction_db;

use crate::error::AppError;
use crate::state::AppState;

pub async fn detail(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let checkpoint = checkpoint_db::get_checkpoint(&state.pool, checkpoint_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("checkpoint {checkpoint_id} not found")))?;

    let corrections = correction_db::list_for_checkpoint(&state.pool, checkpoint_id).await?;

    Ok(Json(serde_json::json!({
        "checkpoint": checkpoint,
        "corrections": corrections,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub decision: UserDecision,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub correction_type: Option<String>,
    #[serde(default)]
    pub reference_files: Vec<String>,
    #[serde(default)]
    pub apply_to_future: bool,
}

pub async fn decision(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    Json(body): Json<DecisionBody>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = checkpoint::process_decision(
        &state.pool,
        &state.coord,
        checkpoint_id,
        DecisionRequest {
            decision: body.decision,
            feedback: body.feedback,
            correction_type: body.correction_type,
            reference_files: body.reference_files,
            apply_to_future: body.apply_to_future,
        },
    )
    .await?;

    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackBody {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "default_reset_evaluations")]
    pub reset_evaluations: bool,
}

fn default_reset_evaluations() -> bool {
    true
}

pub async fn rollback(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
    body: Option<Json<RollbackBody>>,
) -> Result<impl IntoResponse, AppError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let outcome = checkpoint::rollback_to_checkpoint(
        &state.pool,
        &state.coord,
        checkpoint_id,
        body.reason.as_deref(),
        body.reset_evaluations,
    )
    .await?;

    Ok(Json(outcome))
}

pub async fn rollback_preview(
    State(state): State<AppState>,
    Path(checkpoint_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let preview = checkpoint::rollback_preview(&state.pool, checkpoint_id).await?;
    Ok(Json(preview))
}

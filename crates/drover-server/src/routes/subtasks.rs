//! Subtask endpoints: detail, the worker result upload, allocation, the
//! completion hook, review chains, and evaluation reports.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use drover_core::ingest::{self, ResultUpload};
use drover_core::{allocator, review, scheduler};
use drover_db::queries::evaluations::{self as evaluation_db, NewEvaluation};
use drover_db::queries::subtasks as subtask_db;

use crate::error::AppError;
use crate::state::AppState;

pub async fn detail(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let subtask = subtask_db::get_subtask(&state.pool, subtask_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("subtask {subtask_id} not found")))?;

    Ok(Json(subtask))
}

/// Worker result upload. Requires a valid worker API key; the operation is
/// idempotent by subtask id plus terminal-state rejection, so at-least-once
/// delivery upstream is safe.
pub async fn upload_result(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
    headers: HeaderMap,
    Json(upload): Json<ResultUpload>,
) -> Result<impl IntoResponse, AppError> {
    let worker_id = state.authenticate_worker(&headers).await?;
    tracing::debug!(subtask_id = %subtask_id, worker_id = %worker_id, "result upload");

    let outcome =
        ingest::ingest_result(&state.pool, &state.coord, &state.config, subtask_id, upload).await?;

    Ok(Json(serde_json::json!({
        "subtask_id": outcome.subtask_id,
        "status": outcome.status,
        "progress": outcome.progress,
        "newly_allocated": outcome.newly_allocated,
        "task_completed": outcome.task_completed,
        "checkpoint_id": outcome.checkpoint_id,
        "message": format!("Subtask result uploaded successfully. Status: {}", outcome.status),
    })))
}

/// Worker acknowledgement that execution has begun: `queued` moves to
/// `in_progress` and `started_at` is stamped.
pub async fn start(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let worker_id = state.authenticate_worker(&headers).await?;

    let rows = subtask_db::start_execution(&state.pool, subtask_id).await?;
    if rows == 0 {
        return Err(AppError::bad_request(format!(
            "subtask {subtask_id} is not queued for execution"
        )));
    }

    if let Err(e) = state
        .coord
        .set_subtask_status(subtask_id, drover_db::models::SubtaskStatus::InProgress)
        .await
    {
        tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to mirror start");
    }

    tracing::info!(subtask_id = %subtask_id, worker_id = %worker_id, "subtask execution started");
    Ok(Json(serde_json::json!({
        "subtask_id": subtask_id,
        "status": "in_progress",
    })))
}

pub async fn allocate(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let worker =
        allocator::allocate_subtask(&state.pool, &state.coord, &state.config, subtask_id).await?;

    let response = match worker {
        Some(worker) => serde_json::json!({
            "subtask_id": subtask_id,
            "worker_id": worker.id,
            "status": "allocated",
            "message": format!("Subtask allocated to worker {}", worker.machine_name),
        }),
        None => serde_json::json!({
            "subtask_id": subtask_id,
            "worker_id": null,
            "status": "queued",
            "message": "No available workers, subtask added to queue",
        }),
    };

    Ok(Json(response))
}

pub async fn reallocate_queued(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let allocated =
        allocator::reallocate_queued(&state.pool, &state.coord, &state.config).await?;

    Ok(Json(serde_json::json!({
        "reallocated": allocated,
    })))
}

/// The event-driven completion hook, exposed for drivers that track
/// completion externally.
pub async fn complete(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let result =
        scheduler::on_subtask_complete(&state.pool, &state.coord, &state.config, subtask_id)
            .await?;
    Ok(Json(result))
}

pub async fn review_chain(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    subtask_db::get_subtask(&state.pool, subtask_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("subtask {subtask_id} not found")))?;

    let chain = review::review_chain(&state.pool, subtask_id).await?;
    Ok(Json(chain))
}

#[derive(Debug, Deserialize)]
pub struct EvaluationReport {
    #[serde(default)]
    pub code_quality: Option<f64>,
    #[serde(default)]
    pub completeness: Option<f64>,
    #[serde(default)]
    pub security: Option<f64>,
    #[serde(default)]
    pub architecture: Option<f64>,
    #[serde(default)]
    pub testability: Option<f64>,
    pub overall_score: f64,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Record a report from the external evaluator. The freshest report per
/// subtask becomes the authoritative score for checkpoint triggers.
pub async fn record_evaluation(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
    Json(report): Json<EvaluationReport>,
) -> Result<impl IntoResponse, AppError> {
    if !(0.0..=10.0).contains(&report.overall_score) {
        return Err(AppError::bad_request(format!(
            "overall_score {} out of range [0-10]",
            report.overall_score
        )));
    }

    subtask_db::get_subtask(&state.pool, subtask_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("subtask {subtask_id} not found")))?;

    let evaluation = evaluation_db::insert_evaluation(
        &state.pool,
        &NewEvaluation {
            subtask_id,
            code_quality: report.code_quality,
            completeness: report.completeness,
            security: report.security,
            architecture: report.architecture,
            testability: report.testability,
            overall_score: report.overall_score,
            details: report.details,
        },
    )
    .await?;

    Ok((axum::http::StatusCode::CREATED, Json(evaluation)))
}

pub async fn list_evaluations(
    State(state): State<AppState>,
    Path(subtask_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let evaluations = evaluation_db::list_for_subtask(&state.pool, subtask_id).await?;
    Ok(Json(evaluations))
}

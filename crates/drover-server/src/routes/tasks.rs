//! Task endpoints: creation, listing, detail with eager subtasks,
//! cancellation, decomposition, scheduling, and manual checkpoints.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use drover_core::checkpoint;
use drover_core::coordination::events::Event;
use drover_core::{allocator, decomposer, scheduler};
use drover_db::models::{CheckpointFrequency, PrivacyLevel, TaskStatus, TriggerReason};
use drover_db::queries::checkpoints as checkpoint_db;
use drover_db::queries::subtasks as subtask_db;
use drover_db::queries::tasks::{self as task_db, NewTask};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub description: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub checkpoint_frequency: Option<CheckpointFrequency>,
    #[serde(default)]
    pub privacy_level: Option<PrivacyLevel>,
    #[serde(default)]
    pub tool_preferences: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.description.trim().is_empty() {
        return Err(AppError::bad_request("description must not be empty"));
    }

    let mut metadata = match request.metadata {
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        serde_json::Value::Null => serde_json::json!({}),
        _ => return Err(AppError::bad_request("metadata must be an object")),
    };
    if let Some(task_type) = request.task_type {
        metadata["task_type"] = serde_json::Value::String(task_type);
    }

    let task = task_db::insert_task(
        &state.pool,
        &NewTask {
            description: &request.description,
            checkpoint_frequency: request
                .checkpoint_frequency
                .unwrap_or(CheckpointFrequency::Medium),
            privacy_level: request.privacy_level.unwrap_or(PrivacyLevel::Normal),
            tool_preferences: &request.tool_preferences,
            metadata,
        },
    )
    .await?;

    Ok((axum::http::StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let limit = params.limit.clamp(1, 100);
    let tasks = task_db::list_tasks(&state.pool, params.status, limit, params.offset.max(0)).await?;
    Ok(Json(tasks))
}

/// Task detail with its subtasks eager-loaded in a single extra query.
pub async fn detail(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, task_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))?;

    let subtasks = subtask_db::list_for_task(&state.pool, task_id).await?;
    let counts = subtask_db::status_counts(&state.pool, task_id).await?;

    Ok(Json(serde_json::json!({
        "task": task,
        "subtasks": subtasks,
        "counts": {
            "pending": counts.pending,
            "queued": counts.queued,
            "in_progress": counts.in_progress,
            "completed": counts.completed,
            "failed": counts.failed,
            "cancelled": counts.cancelled,
            "correcting": counts.correcting,
            "total": counts.total,
        },
    })))
}

/// Cancel a task: terminal status, all non-terminal subtasks cancelled,
/// mirrors updated. In-flight worker executions keep running; their
/// uploads bounce off the terminal-state guard.
pub async fn cancel(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let task = task_db::get_task(&state.pool, task_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))?;

    let rows = task_db::cancel_task(&state.pool, task_id).await?;
    if rows == 0 {
        return Err(AppError::bad_request(format!(
            "task {task_id} is already {}",
            task.status
        )));
    }

    let cancelled = subtask_db::cancel_nonterminal_for_task(&state.pool, task_id).await?;
    for subtask_id in &cancelled {
        if let Err(e) = state
            .coord
            .set_subtask_status(*subtask_id, drover_db::models::SubtaskStatus::Cancelled)
            .await
        {
            tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to mirror cancellation");
        }
        if let Err(e) = state.coord.remove_from_in_progress(*subtask_id).await {
            tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to prune in-progress set");
        }
    }

    state
        .coord
        .set_task_status(task_id, TaskStatus::Cancelled)
        .await
        .map_err(AppError::internal)?;
    if let Err(e) = state
        .coord
        .publish_event(&Event::task_update(task_id, TaskStatus::Cancelled, task.progress))
        .await
    {
        tracing::warn!(task_id = %task_id, error = %e, "failed to publish cancellation");
    }

    Ok(Json(serde_json::json!({
        "task_id": task_id,
        "status": TaskStatus::Cancelled,
        "subtasks_cancelled": cancelled.len(),
    })))
}

pub async fn decompose(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let subtasks = decomposer::decompose_task(&state.pool, &state.coord, task_id).await?;
    Ok(Json(subtasks))
}

pub async fn schedule(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let result =
        scheduler::schedule_task(&state.pool, &state.coord, &state.config, task_id).await?;
    Ok(Json(result))
}

/// Allocate every currently ready subtask of a task.
pub async fn allocate_ready(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    task_db::get_task(&state.pool, task_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))?;

    let outcomes =
        allocator::allocate_ready_subtasks(&state.pool, &state.coord, &state.config, task_id)
            .await?;

    let allocations: Vec<serde_json::Value> = outcomes
        .iter()
        .map(|(subtask, worker)| {
            serde_json::json!({
                "subtask_id": subtask.id,
                "worker_id": worker.as_ref().map(|w| w.id),
                "status": if worker.is_some() { "allocated" } else { "queued" },
            })
        })
        .collect();

    let total_allocated = outcomes.iter().filter(|(_, w)| w.is_some()).count();
    Ok(Json(serde_json::json!({
        "task_id": task_id,
        "allocations": allocations,
        "total_allocated": total_allocated,
        "total_queued": outcomes.len() - total_allocated,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ManualCheckpointRequest {
    #[serde(default)]
    pub context: serde_json::Value,
}

pub async fn manual_checkpoint(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
    request: Option<Json<ManualCheckpointRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let context = request
        .map(|Json(r)| r.context)
        .filter(|c| c.is_object())
        .unwrap_or_else(|| serde_json::json!({"reason": "manual_request"}));

    let checkpoint = checkpoint::create_checkpoint(
        &state.pool,
        &state.coord,
        task_id,
        TriggerReason::Manual,
        context,
    )
    .await?;

    Ok((axum::http::StatusCode::CREATED, Json(checkpoint)))
}

pub async fn checkpoints(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    task_db::get_task(&state.pool, task_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("task {task_id} not found")))?;

    let checkpoints = checkpoint_db::list_for_task(&state.pool, task_id).await?;
    Ok(Json(checkpoints))
}

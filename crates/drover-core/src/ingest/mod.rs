//! Result ingest: the idempotent upload path workers hit when a subtask
//! finishes.
//!
//! The core commit (status, output, error, timestamps) either happens or
//! the endpoint fails; every side effect after it -- mirrors, worker
//! release, review fan-out, the scheduler's completion hook, checkpoint
//! triggers -- is best-effort and only logged on failure.
//!
//! Ordering at the tail follows the upload contract: the scheduler's
//! completion hook (task-completion check plus new-ready allocation) runs
//! first, then the checkpoint triggers. A task that just reached a
//! terminal state takes no further checkpoints.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{CorrectionResult, SubtaskStatus, SubtaskType};
use drover_db::queries::corrections as correction_db;
use drover_db::queries::evaluations as evaluation_db;
use drover_db::queries::subtasks as subtask_db;

use crate::allocator;
use crate::checkpoint::trigger as checkpoint_trigger;
use crate::config::ControlConfig;
use crate::coordination::Coordination;
use crate::coordination::events::Event;
use crate::decomposer;
use crate::error::{ControlError, ControlResult};
use crate::review;
use crate::scheduler;

/// A worker's result upload.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultUpload {
    pub status: SubtaskStatus,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// What the upload produced.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub subtask_id: Uuid,
    pub status: SubtaskStatus,
    pub progress: i32,
    pub newly_allocated: usize,
    pub task_completed: bool,
    pub checkpoint_id: Option<Uuid>,
}

/// Ingest one result.
///
/// Rejections: unknown subtask (404), subtask not `in_progress`/`queued`
/// (400 -- this is what makes redelivery of the same result, or a
/// conflicting terminal state, harmless), status other than
/// completed/failed (400).
pub async fn ingest_result(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    subtask_id: Uuid,
    upload: ResultUpload,
) -> ControlResult<IngestOutcome> {
    if !matches!(
        upload.status,
        SubtaskStatus::Completed | SubtaskStatus::Failed
    ) {
        return Err(ControlError::invalid(format!(
            "result status must be completed or failed, got {}",
            upload.status
        )));
    }

    let subtask = subtask_db::get_subtask(pool, subtask_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("subtask {subtask_id}")))?;

    if !matches!(
        subtask.status,
        SubtaskStatus::InProgress | SubtaskStatus::Queued
    ) {
        return Err(ControlError::bad_state(format!(
            "subtask {subtask_id} is not executing (status: {})",
            subtask.status
        )));
    }

    // Core commit. The optimistic WHERE guards against a concurrent upload
    // having won the race after our read.
    let progress = if upload.status == SubtaskStatus::Completed {
        100
    } else {
        0
    };
    let mut output = upload.result.clone();
    if !output.is_object() {
        output = serde_json::json!({ "value": output });
    }
    if let (Some(obj), Some(secs)) = (output.as_object_mut(), upload.execution_time) {
        obj.insert("execution_time".to_owned(), serde_json::json!(secs));
    }

    let rows = subtask_db::record_result(
        pool,
        subtask_id,
        upload.status,
        &output,
        upload.error.as_deref(),
        progress,
    )
    .await?;
    if rows == 0 {
        return Err(ControlError::bad_state(format!(
            "subtask {subtask_id} result was recorded concurrently"
        )));
    }

    tracing::info!(
        subtask_id = %subtask_id,
        status = %upload.status,
        execution_time = ?upload.execution_time,
        "subtask result recorded"
    );

    // Everything past this point is best-effort.
    if let Err(e) = coord.set_subtask_status(subtask_id, upload.status).await {
        tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to mirror subtask status");
    }
    if let Err(e) = coord.remove_from_in_progress(subtask_id).await {
        tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to update in-progress set");
    }

    if let Some(worker_id) = subtask.assigned_worker {
        if let Err(e) = allocator::release_worker(pool, coord, worker_id).await {
            tracing::warn!(worker_id = %worker_id, error = %e, "failed to release worker");
        }
    }

    resolve_corrections(pool, subtask_id, upload.status).await;

    if upload.status == SubtaskStatus::Completed {
        fan_out_review_chain(pool, config, &subtask, subtask_id).await;
    }

    let mut outcome = IngestOutcome {
        subtask_id,
        status: upload.status,
        progress,
        newly_allocated: 0,
        task_completed: false,
        checkpoint_id: None,
    };

    // The scheduler's completion hook runs before the checkpoint triggers:
    // it checks task completion and allocates the newly ready set.
    if upload.status == SubtaskStatus::Completed {
        match scheduler::on_subtask_complete(pool, coord, config, subtask_id).await {
            Ok(completion) => {
                outcome.newly_allocated = completion.newly_allocated;
                outcome.task_completed = completion.task_completed;
            }
            Err(e) => {
                tracing::warn!(subtask_id = %subtask_id, error = %e, "scheduler trigger failed");
            }
        }
    } else {
        // A failed subtask still moves its parent's state machine.
        match decomposer::check_task_completion(pool, coord, subtask.task_id).await {
            Ok(terminal) => outcome.task_completed = terminal,
            Err(e) => {
                tracing::warn!(task_id = %subtask.task_id, error = %e, "completion check failed");
            }
        }
    }

    // Latest evaluation, if the external evaluator already reported one.
    let evaluation_score = match evaluation_db::latest_for_subtask(pool, subtask_id).await {
        Ok(eval) => eval.map(|e| e.overall_score),
        Err(e) => {
            tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to read latest evaluation");
            None
        }
    };

    if let Err(e) = coord
        .publish_event(&Event::subtask_complete(
            subtask_id,
            subtask.task_id,
            upload.status,
            evaluation_score,
        ))
        .await
    {
        tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to publish subtask event");
    }

    let error_occurred = upload.status == SubtaskStatus::Failed
        || upload
            .error
            .as_deref()
            .map(|e| !e.trim().is_empty())
            .unwrap_or(false);

    match checkpoint_trigger::check_and_trigger(
        pool,
        coord,
        config,
        subtask.task_id,
        Some(subtask_id),
        evaluation_score,
        error_occurred,
    )
    .await
    {
        Ok(Some(checkpoint)) => {
            tracing::info!(
                checkpoint_id = %checkpoint.id,
                task_id = %subtask.task_id,
                "automatic checkpoint triggered"
            );
            outcome.checkpoint_id = Some(checkpoint.id);
        }
        Ok(None) => {}
        Err(e) => {
            tracing::warn!(subtask_id = %subtask_id, error = %e, "checkpoint trigger check failed");
        }
    }

    tracing::info!(
        subtask_id = %subtask_id,
        status = %upload.status,
        newly_allocated = outcome.newly_allocated,
        task_completed = outcome.task_completed,
        checkpoint_triggered = outcome.checkpoint_id.is_some(),
        "subtask result ingested"
    );

    Ok(outcome)
}

/// Close out any pending corrections on the subtask: a successful re-run
/// resolves them, a failed one records another failed attempt.
async fn resolve_corrections(pool: &PgPool, subtask_id: Uuid, status: SubtaskStatus) {
    let result = match status {
        SubtaskStatus::Completed => CorrectionResult::Success,
        _ => CorrectionResult::Failed,
    };

    match correction_db::pending_for_subtask(pool, subtask_id).await {
        Ok(pending) => {
            for correction in pending {
                if let Err(e) = correction_db::set_result(pool, correction.id, result).await {
                    tracing::warn!(
                        correction_id = %correction.id,
                        error = %e,
                        "failed to record correction outcome"
                    );
                }
            }
        }
        Err(e) => {
            tracing::warn!(subtask_id = %subtask_id, error = %e, "failed to list pending corrections");
        }
    }
}

/// Grow the review chain according to what just completed. All spawns are
/// best-effort; a review that cannot be created never fails the upload.
///
/// A completed code-generation subtask only gets an auto-spawned review
/// when its DAG does not already contain one depending on it (templates
/// usually ship their own review step).
async fn fan_out_review_chain(
    pool: &PgPool,
    config: &ControlConfig,
    subtask: &drover_db::models::Subtask,
    subtask_id: Uuid,
) {
    let outcome = match subtask.subtask_type {
        SubtaskType::CodeGeneration => {
            match has_dependent_review(pool, subtask).await {
                Ok(true) => {
                    tracing::debug!(
                        subtask_id = %subtask_id,
                        "a review subtask already depends on this output"
                    );
                    Ok(())
                }
                Ok(false) => review::create_review_subtask(pool, subtask_id, 1)
                    .await
                    .map(|review| {
                        tracing::info!(review_subtask_id = %review.id, "spawned review subtask");
                    }),
                Err(e) => Err(crate::error::ControlError::Internal(e)),
            }
        }
        SubtaskType::CodeReview => review::handle_review_completed(pool, config, subtask_id)
            .await
            .map(|fix| {
                if let Some(fix) = fix {
                    tracing::info!(fix_subtask_id = %fix.id, "spawned fix subtask");
                }
            }),
        SubtaskType::CodeFix => review::handle_fix_completion(pool, config, subtask_id)
            .await
            .map(|rereview| {
                if let Some(rereview) = rereview {
                    tracing::info!(review_subtask_id = %rereview.id, "spawned re-review subtask");
                }
            }),
        _ => Ok(()),
    };

    if let Err(e) = outcome {
        tracing::warn!(subtask_id = %subtask_id, error = %e, "review chain fan-out failed");
    }
}

async fn has_dependent_review(
    pool: &PgPool,
    subtask: &drover_db::models::Subtask,
) -> anyhow::Result<bool> {
    let reviews =
        subtask_db::list_for_task_by_type(pool, subtask.task_id, SubtaskType::CodeReview).await?;
    Ok(reviews
        .iter()
        .any(|r| r.dependencies.contains(&subtask.id)))
}

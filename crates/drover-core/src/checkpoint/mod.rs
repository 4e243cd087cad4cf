//! Checkpoint engine: creation, frequency gating, human decision
//! processing, and rollback.
//!
//! While a checkpoint is `pending_review` its task sits in the
//! `checkpoint` status, which keeps it out of the scheduler's active set;
//! nothing new is handed to workers until a decision lands.

pub mod trigger;

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{
    Checkpoint, CheckpointFrequency, CheckpointStatus, SubtaskStatus, Task, TaskStatus,
    TriggerReason, UserDecision,
};
use drover_db::queries::checkpoints as checkpoint_db;
use drover_db::queries::corrections::{self as correction_db, NewCorrection};
use drover_db::queries::evaluations as evaluation_db;
use drover_db::queries::subtasks as subtask_db;
use drover_db::queries::tasks as task_db;

use crate::coordination::Coordination;
use crate::coordination::events::Event;
use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};

/// Frequency gate for a prospective checkpoint.
///
/// Manual and review-issues triggers always fire; low-score fires below
/// the evaluation threshold; the periodic trigger respects the task's
/// checkpoint frequency (high = every candidate, medium = a new 25%
/// milestone, low = a new 50% milestone). Timeout and cycle-limit always
/// fire: escalations are never dropped.
pub async fn should_trigger(
    pool: &PgPool,
    task: &Task,
    reason: TriggerReason,
    evaluation_score: Option<f64>,
    config: &ControlConfig,
) -> Result<bool> {
    match reason {
        TriggerReason::Manual
        | TriggerReason::ReviewIssuesFound
        | TriggerReason::Timeout
        | TriggerReason::CycleLimit => Ok(true),
        TriggerReason::LowEvaluationScore => Ok(evaluation_score
            .map(|s| s < config.evaluation_threshold)
            .unwrap_or(false)),
        TriggerReason::CodeGenerationComplete => {
            let counts = subtask_db::status_counts(pool, task.id).await?;
            if counts.total == 0 {
                return Ok(false);
            }
            Ok(match task.checkpoint_frequency {
                CheckpointFrequency::High => true,
                CheckpointFrequency::Medium => {
                    crossed_milestone(counts.completed, counts.total, 25)
                }
                CheckpointFrequency::Low => crossed_milestone(counts.completed, counts.total, 50),
            })
        }
    }
}

/// Did the latest completion push progress over a new `step`% milestone?
fn crossed_milestone(completed: i64, total: i64, step: i64) -> bool {
    if completed == 0 || total == 0 {
        return false;
    }
    let milestone = (completed * 100 / total) / step * step;
    let previous = ((completed - 1) * 100 / total) / step * step;
    milestone > previous
}

/// Create a checkpoint: snapshot the completed subtask ids, pause the task,
/// announce the pause.
pub async fn create_checkpoint(
    pool: &PgPool,
    coord: &Coordination,
    task_id: Uuid,
    reason: TriggerReason,
    mut context: serde_json::Value,
) -> ControlResult<Checkpoint> {
    tracing::info!(task_id = %task_id, reason = %reason, "creating checkpoint");

    let task = task_db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("task {task_id}")))?;

    if task.status.is_terminal() {
        return Err(ControlError::bad_state(format!(
            "task {task_id} is {}, checkpoints require an active task",
            task.status
        )));
    }
    if checkpoint_db::has_pending_review(pool, task_id).await? {
        return Err(ControlError::bad_state(format!(
            "task {task_id} already has a checkpoint pending review"
        )));
    }

    let snapshot = subtask_db::completed_ids_for_task(pool, task_id).await?;

    if let Some(obj) = context.as_object_mut() {
        obj.insert(
            "trigger_reason".to_owned(),
            serde_json::Value::String(reason.to_string()),
        );
    }

    let checkpoint =
        checkpoint_db::insert_checkpoint(pool, task_id, reason, &snapshot, &context).await?;

    task_db::update_task_status(pool, task_id, TaskStatus::Checkpoint).await?;
    coord
        .set_task_status(task_id, TaskStatus::Checkpoint)
        .await
        .map_err(ControlError::Internal)?;

    if let Err(e) = coord
        .publish_event(&Event::CheckpointReached {
            checkpoint_id: checkpoint.id,
            task_id,
            trigger_reason: reason,
            context: checkpoint.context.clone(),
            timestamp: chrono::Utc::now(),
        })
        .await
    {
        tracing::warn!(checkpoint_id = %checkpoint.id, error = %e, "failed to publish checkpoint event");
    }

    tracing::info!(
        checkpoint_id = %checkpoint.id,
        task_id = %task_id,
        snapshot = snapshot.len(),
        "checkpoint created"
    );

    Ok(checkpoint)
}

/// A human decision on a checkpoint.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub decision: UserDecision,
    pub feedback: Option<String>,
    pub correction_type: Option<String>,
    pub reference_files: Vec<String>,
    pub apply_to_future: bool,
}

/// Outcome of applying a decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub checkpoint_id: Uuid,
    pub status: CheckpointStatus,
    pub task_status: TaskStatus,
    pub corrections_created: usize,
    pub next_action: String,
}

/// Apply a human decision to a pending checkpoint.
///
/// - accept: approve, task resumes normal scheduling.
/// - correct: one Correction per snapshotted subtask; each enters
///   `correcting` and is re-issued by the next cycle.
/// - reject: task cancelled; unstarted subtasks cancelled (in-flight work
///   finishes and is rejected at upload).
pub async fn process_decision(
    pool: &PgPool,
    coord: &Coordination,
    checkpoint_id: Uuid,
    request: DecisionRequest,
) -> ControlResult<DecisionOutcome> {
    tracing::info!(
        checkpoint_id = %checkpoint_id,
        decision = %request.decision,
        "processing checkpoint decision"
    );

    let checkpoint = checkpoint_db::get_checkpoint(pool, checkpoint_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("checkpoint {checkpoint_id}")))?;

    if checkpoint.status != CheckpointStatus::PendingReview {
        return Err(ControlError::bad_state(format!(
            "checkpoint {checkpoint_id} is not pending review"
        )));
    }

    let task_id = checkpoint.task_id;

    let (checkpoint_status, task_status) = match request.decision {
        UserDecision::Accept => (CheckpointStatus::Approved, TaskStatus::InProgress),
        UserDecision::Correct => (CheckpointStatus::Corrected, TaskStatus::InProgress),
        UserDecision::Reject => (CheckpointStatus::Rejected, TaskStatus::Cancelled),
    };

    // The optimistic lock on pending_review makes decisions one-shot;
    // record it before any side effect so a concurrent decision cannot
    // double-create corrections.
    let rows = checkpoint_db::record_decision(
        pool,
        checkpoint_id,
        checkpoint_status,
        request.decision,
        request.feedback.as_deref(),
    )
    .await?;
    if rows == 0 {
        return Err(ControlError::bad_state(format!(
            "checkpoint {checkpoint_id} was decided concurrently"
        )));
    }

    let mut corrections_created = 0;
    let next_action = match request.decision {
        UserDecision::Accept => {
            task_db::update_task_status(pool, task_id, task_status).await?;
            requeue_parked_subtasks(pool, coord, task_id).await?;
            "task continues with the next subtask".to_owned()
        }
        UserDecision::Correct => {
            for subtask_id in &checkpoint.subtasks_completed {
                let correction = NewCorrection {
                    checkpoint_id,
                    subtask_id: *subtask_id,
                    correction_type: request.correction_type.as_deref().unwrap_or("other"),
                    guidance: request
                        .feedback
                        .as_deref()
                        .unwrap_or("Please review and correct the output"),
                    reference_files: &request.reference_files,
                    apply_to_future: request.apply_to_future,
                };
                correction_db::insert_correction(pool, &correction).await?;
                corrections_created += 1;

                subtask_db::set_status(pool, *subtask_id, SubtaskStatus::Correcting).await?;
                coord
                    .set_subtask_status(*subtask_id, SubtaskStatus::Correcting)
                    .await
                    .map_err(ControlError::Internal)?;
            }
            task_db::update_task_status(pool, task_id, task_status).await?;
            requeue_parked_subtasks(pool, coord, task_id).await?;
            format!(
                "corrections created for {corrections_created} subtask(s); \
                 the scheduler re-issues them on the next cycle"
            )
        }
        UserDecision::Reject => {
            task_db::cancel_task(pool, task_id).await?;
            let cancelled = subtask_db::cancel_unstarted_for_task(pool, task_id).await?;
            tracing::info!(
                task_id = %task_id,
                cancelled = cancelled.len(),
                "rejected checkpoint cancelled unstarted subtasks"
            );
            "task cancelled by user".to_owned()
        }
    };

    coord
        .set_task_status(task_id, task_status)
        .await
        .map_err(ControlError::Internal)?;

    if let Err(e) = coord
        .publish_event(&Event::CheckpointDecision {
            checkpoint_id,
            task_id,
            decision: request.decision,
            task_status,
            corrections_created,
            timestamp: chrono::Utc::now(),
        })
        .await
    {
        tracing::warn!(checkpoint_id = %checkpoint_id, error = %e, "failed to publish decision event");
    }

    tracing::info!(
        checkpoint_id = %checkpoint_id,
        decision = %request.decision,
        corrections_created,
        "checkpoint decision processed"
    );

    Ok(DecisionOutcome {
        checkpoint_id,
        status: checkpoint_status,
        task_status,
        corrections_created,
        next_action,
    })
}

/// Put a resuming task's queued-but-unassigned subtasks back on the
/// pending queue. The drain discards entries it cannot allocate, so a
/// pause can leave queued rows with no queue entry; a duplicate entry is
/// harmless (the drain discards it once the subtask is assigned).
async fn requeue_parked_subtasks(
    pool: &PgPool,
    coord: &Coordination,
    task_id: Uuid,
) -> Result<()> {
    for subtask in subtask_db::list_for_task(pool, task_id).await? {
        if subtask.status == SubtaskStatus::Queued && subtask.assigned_worker.is_none() {
            coord.push_to_queue(subtask.id).await?;
        }
    }
    Ok(())
}

/// Outcome of a rollback.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackOutcome {
    pub checkpoint_id: Uuid,
    pub task_id: Uuid,
    pub subtasks_reset: usize,
    pub evaluations_cleared: u64,
    pub checkpoints_deleted: u64,
    pub task_progress: i32,
}

/// Roll a task back to a checkpoint: every subtask completed after the
/// snapshot is reset to a clean pending state, its evaluations optionally
/// deleted, later checkpoints are discarded, and progress is recomputed
/// from the snapshot.
///
/// Serialised per checkpoint through a coordination lock, like the
/// scheduler cycle: two concurrent rollbacks of the same checkpoint would
/// double-delete and double-reset.
///
/// In-flight executions are not pre-empted: a worker still running a reset
/// subtask will fail its upload against the subtask's non-executing state.
pub async fn rollback_to_checkpoint(
    pool: &PgPool,
    coord: &Coordination,
    checkpoint_id: Uuid,
    reason: Option<&str>,
    reset_evaluations: bool,
) -> ControlResult<RollbackOutcome> {
    let resource = format!("rollback:{checkpoint_id}");
    let holder = format!("drover-{}", std::process::id());

    let outcome = coord
        .with_lock(
            &resource,
            &holder,
            std::time::Duration::from_secs(60),
            rollback_locked(pool, coord, checkpoint_id, reason, reset_evaluations),
        )
        .await?;

    outcome.ok_or_else(|| {
        ControlError::bad_state(format!(
            "a rollback for checkpoint {checkpoint_id} is already in progress"
        ))
    })
}

async fn rollback_locked(
    pool: &PgPool,
    coord: &Coordination,
    checkpoint_id: Uuid,
    reason: Option<&str>,
    reset_evaluations: bool,
) -> ControlResult<RollbackOutcome> {
    tracing::info!(checkpoint_id = %checkpoint_id, ?reason, "rolling back to checkpoint");

    let checkpoint = checkpoint_db::get_checkpoint(pool, checkpoint_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("checkpoint {checkpoint_id}")))?;

    let task = task_db::get_task(pool, checkpoint.task_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("task {}", checkpoint.task_id)))?;

    if task.status.is_terminal() {
        return Err(ControlError::bad_state(format!(
            "cannot roll back task in '{}' status",
            task.status
        )));
    }

    let snapshot: std::collections::HashSet<Uuid> =
        checkpoint.subtasks_completed.iter().copied().collect();

    let subtasks = subtask_db::list_for_task(pool, task.id).await?;
    let to_reset: Vec<&drover_db::models::Subtask> = subtasks
        .iter()
        .filter(|s| s.status == SubtaskStatus::Completed && !snapshot.contains(&s.id))
        .collect();

    let mut evaluations_cleared = 0;
    for subtask in &to_reset {
        subtask_db::reset_to_pending(pool, subtask.id).await?;
        coord
            .set_subtask_status(subtask.id, SubtaskStatus::Pending)
            .await
            .map_err(ControlError::Internal)?;

        if reset_evaluations {
            evaluations_cleared += evaluation_db::delete_for_subtask(pool, subtask.id).await?;
        }
        tracing::debug!(subtask_id = %subtask.id, name = %subtask.name, "reset subtask");
    }

    let total = subtasks.len() as i64;
    let new_progress = if total == 0 {
        0
    } else {
        ((snapshot.len() as i64 * 100) / total) as i32
    };

    task_db::reopen_task(pool, task.id, new_progress).await?;
    coord
        .set_task_status(task.id, TaskStatus::InProgress)
        .await
        .map_err(ControlError::Internal)?;
    coord
        .set_task_progress(task.id, new_progress)
        .await
        .map_err(ControlError::Internal)?;

    let checkpoints_deleted =
        checkpoint_db::delete_after(pool, task.id, checkpoint.triggered_at).await?;

    let mut note = format!("[rollback] performed at {}", chrono::Utc::now().to_rfc3339());
    if let Some(reason) = reason {
        note.push_str(&format!("; reason: {reason}"));
    }
    checkpoint_db::append_notes(pool, checkpoint_id, &note).await?;

    if let Err(e) = coord
        .publish_event(&Event::CheckpointRollback {
            checkpoint_id,
            task_id: task.id,
            subtasks_reset: to_reset.len(),
            reason: reason.map(str::to_owned),
            timestamp: chrono::Utc::now(),
        })
        .await
    {
        tracing::warn!(checkpoint_id = %checkpoint_id, error = %e, "failed to publish rollback event");
    }

    tracing::info!(
        checkpoint_id = %checkpoint_id,
        task_id = %task.id,
        subtasks_reset = to_reset.len(),
        evaluations_cleared,
        "rollback complete"
    );

    Ok(RollbackOutcome {
        checkpoint_id,
        task_id: task.id,
        subtasks_reset: to_reset.len(),
        evaluations_cleared,
        checkpoints_deleted,
        task_progress: new_progress,
    })
}

/// What a rollback would touch, without mutating anything.
#[derive(Debug, Clone, Serialize)]
pub struct RollbackPreview {
    pub checkpoint_id: Uuid,
    pub task_id: Uuid,
    pub current_progress: i32,
    pub new_progress_after_rollback: i32,
    pub subtasks_to_reset: Vec<SubtaskResetPreview>,
    pub evaluations_to_clear: usize,
    pub checkpoints_to_delete: i64,
    pub can_rollback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubtaskResetPreview {
    pub subtask_id: Uuid,
    pub name: String,
    pub has_output: bool,
    pub evaluations_count: usize,
}

pub async fn rollback_preview(pool: &PgPool, checkpoint_id: Uuid) -> ControlResult<RollbackPreview> {
    let checkpoint = checkpoint_db::get_checkpoint(pool, checkpoint_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("checkpoint {checkpoint_id}")))?;

    let task = task_db::get_task(pool, checkpoint.task_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("task {}", checkpoint.task_id)))?;

    let snapshot: std::collections::HashSet<Uuid> =
        checkpoint.subtasks_completed.iter().copied().collect();
    let subtasks = subtask_db::list_for_task(pool, task.id).await?;

    let mut previews = Vec::new();
    let mut evaluations_total = 0;
    for subtask in subtasks
        .iter()
        .filter(|s| s.status == SubtaskStatus::Completed && !snapshot.contains(&s.id))
    {
        let evals = evaluation_db::list_for_subtask(pool, subtask.id).await?;
        evaluations_total += evals.len();
        previews.push(SubtaskResetPreview {
            subtask_id: subtask.id,
            name: subtask.name.clone(),
            has_output: subtask.output.is_some(),
            evaluations_count: evals.len(),
        });
    }

    let total = subtasks.len() as i64;
    let new_progress = if total == 0 {
        0
    } else {
        ((snapshot.len() as i64 * 100) / total) as i32
    };

    let checkpoints_to_delete =
        checkpoint_db::count_after(pool, task.id, checkpoint.triggered_at).await?;

    Ok(RollbackPreview {
        checkpoint_id,
        task_id: task.id,
        current_progress: task.progress,
        new_progress_after_rollback: new_progress,
        subtasks_to_reset: previews,
        evaluations_to_clear: evaluations_total,
        checkpoints_to_delete,
        can_rollback: !task.status.is_terminal(),
    })
}

//! Automatic checkpoint triggering.
//!
//! Driven by ResultIngest after every upload; each rule is gated by
//! configuration. Timeout and cycle-limit triggers escalate: their context
//! carries `requires_attention` so they are never silently dropped.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Checkpoint, Task, TaskStatus, TriggerReason};
use drover_db::queries::checkpoints as checkpoint_db;
use drover_db::queries::corrections as correction_db;
use drover_db::queries::subtasks as subtask_db;
use drover_db::queries::tasks as task_db;

use crate::config::ControlConfig;
use crate::coordination::Coordination;

use super::{create_checkpoint, should_trigger};

/// Evaluate every trigger rule for a task and create a checkpoint for the
/// first one that fires. Returns the created checkpoint, if any.
///
/// Trigger failures are contained: a broken rule logs and yields `None`
/// rather than failing the ingest path that called it.
pub async fn check_and_trigger(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task_id: Uuid,
    subtask_id: Option<Uuid>,
    evaluation_score: Option<f64>,
    error_occurred: bool,
) -> Result<Option<Checkpoint>> {
    tracing::info!(
        task_id = %task_id,
        subtask_id = ?subtask_id,
        evaluation_score = ?evaluation_score,
        error_occurred,
        "checking checkpoint triggers"
    );

    let Some(task) = task_db::get_task(pool, task_id).await? else {
        tracing::warn!(task_id = %task_id, "task not found for checkpoint check");
        return Ok(None);
    };

    // A paused or finished task takes no further checkpoints.
    if task.status == TaskStatus::Checkpoint || task.status.is_terminal() {
        tracing::debug!(task_id = %task_id, status = %task.status, "task not eligible");
        return Ok(None);
    }

    if config.checkpoint_enable_timeout_trigger {
        if let Some(checkpoint) = check_timeout(pool, coord, config, &task).await? {
            return Ok(Some(checkpoint));
        }
    }

    if config.checkpoint_enable_error_trigger && error_occurred {
        tracing::info!(task_id = %task_id, "error trigger activated");
        let context = serde_json::json!({
            "reason": "error_during_execution",
            "subtask_id": subtask_id,
            "auto_triggered": true,
        });
        let checkpoint = create_checkpoint(
            pool,
            coord,
            task_id,
            TriggerReason::ReviewIssuesFound,
            context,
        )
        .await?;
        return Ok(Some(checkpoint));
    }

    if config.checkpoint_enable_evaluation_trigger {
        if let Some(score) = evaluation_score {
            if score < config.evaluation_threshold {
                tracing::info!(
                    task_id = %task_id,
                    score,
                    threshold = config.evaluation_threshold,
                    "low evaluation score trigger activated"
                );
                let context = serde_json::json!({
                    "reason": "low_evaluation_score",
                    "score": score,
                    "threshold": config.evaluation_threshold,
                    "subtask_id": subtask_id,
                    "auto_triggered": true,
                });
                let checkpoint = create_checkpoint(
                    pool,
                    coord,
                    task_id,
                    TriggerReason::LowEvaluationScore,
                    context,
                )
                .await?;
                return Ok(Some(checkpoint));
            }
        }
    }

    if config.checkpoint_enable_periodic_trigger && subtask_id.is_some() {
        if let Some(checkpoint) = check_periodic(pool, coord, config, &task).await? {
            return Ok(Some(checkpoint));
        }
    }

    if let Some(checkpoint) = check_cycle_limit(pool, coord, config, &task).await? {
        return Ok(Some(checkpoint));
    }

    tracing::debug!(task_id = %task_id, "no checkpoint trigger activated");
    Ok(None)
}

/// Periodic trigger: a candidate fires once `checkpoint_subtask_interval`
/// subtasks have completed since the last checkpoint's snapshot, and the
/// task's frequency setting then decides (high = always, medium = new 25%
/// milestone, low = new 50% milestone).
///
/// The "since last" arithmetic uses the latest checkpoint's snapshot size.
/// After a rollback that snapshot can exceed the live completed count,
/// which suppresses this trigger until completions catch back up.
async fn check_periodic(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task: &Task,
) -> Result<Option<Checkpoint>> {
    let counts = subtask_db::status_counts(pool, task.id).await?;
    let completed = counts.completed;

    let last_snapshot_len = checkpoint_db::latest_for_task(pool, task.id)
        .await?
        .map(|c| c.subtasks_completed.len() as i64)
        .unwrap_or(0);

    let since_last = completed - last_snapshot_len;
    if since_last < config.checkpoint_subtask_interval {
        return Ok(None);
    }

    if !should_trigger(
        pool,
        task,
        TriggerReason::CodeGenerationComplete,
        None,
        config,
    )
    .await?
    {
        tracing::debug!(task_id = %task.id, "periodic candidate declined by frequency gate");
        return Ok(None);
    }

    tracing::info!(
        task_id = %task.id,
        completed,
        since_last,
        interval = config.checkpoint_subtask_interval,
        "periodic trigger activated"
    );

    let context = serde_json::json!({
        "reason": "periodic_completion",
        "completed_count": completed,
        "subtasks_since_last": since_last,
        "interval": config.checkpoint_subtask_interval,
        "auto_triggered": true,
    });
    let checkpoint = create_checkpoint(
        pool,
        coord,
        task.id,
        TriggerReason::CodeGenerationComplete,
        context,
    )
    .await?;
    Ok(Some(checkpoint))
}

/// Timeout trigger: the task has been running longer than
/// `checkpoint_timeout_hours`.
async fn check_timeout(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task: &Task,
) -> Result<Option<Checkpoint>> {
    let Some(started_at) = task.started_at else {
        return Ok(None);
    };

    let elapsed = chrono::Utc::now() - started_at;
    let threshold = chrono::Duration::hours(config.checkpoint_timeout_hours);
    if elapsed <= threshold {
        return Ok(None);
    }

    let elapsed_hours = elapsed.num_minutes() as f64 / 60.0;
    tracing::warn!(
        task_id = %task.id,
        elapsed_hours,
        threshold_hours = config.checkpoint_timeout_hours,
        "timeout trigger activated"
    );

    let context = serde_json::json!({
        "reason": "timeout_escalation",
        "elapsed_hours": elapsed_hours,
        "threshold_hours": config.checkpoint_timeout_hours,
        "auto_triggered": true,
        "requires_attention": true,
    });
    let checkpoint =
        create_checkpoint(pool, coord, task.id, TriggerReason::Timeout, context).await?;
    Ok(Some(checkpoint))
}

/// Cycle-limit trigger: some subtask has accumulated
/// `checkpoint_max_correction_cycles` pending-or-failed corrections.
async fn check_cycle_limit(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task: &Task,
) -> Result<Option<Checkpoint>> {
    let counts = correction_db::unresolved_counts_by_subtask(pool, task.id).await?;
    let over_limit: Vec<Uuid> = counts
        .iter()
        .filter(|(_, count)| *count >= config.checkpoint_max_correction_cycles)
        .map(|(id, _)| *id)
        .collect();

    if over_limit.is_empty() {
        return Ok(None);
    }

    tracing::warn!(
        task_id = %task.id,
        subtasks = ?over_limit,
        max_cycles = config.checkpoint_max_correction_cycles,
        "correction cycle limit exceeded"
    );

    let context = serde_json::json!({
        "reason": "excessive_correction_cycles",
        "subtasks_with_issues": over_limit,
        "max_cycles": config.checkpoint_max_correction_cycles,
        "auto_triggered": true,
        "requires_attention": true,
    });
    let checkpoint =
        create_checkpoint(pool, coord, task.id, TriggerReason::CycleLimit, context).await?;
    Ok(Some(checkpoint))
}

//! Database query functions for the `checkpoints` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Checkpoint, CheckpointStatus, TriggerReason, UserDecision};

/// Create a checkpoint in `pending_review` with the snapshot of completed
/// subtask ids at trigger time.
pub async fn insert_checkpoint(
    pool: &PgPool,
    task_id: Uuid,
    trigger_reason: TriggerReason,
    subtasks_completed: &[Uuid],
    context: &serde_json::Value,
) -> Result<Checkpoint> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints (task_id, trigger_reason, subtasks_completed, context) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(trigger_reason)
    .bind(subtasks_completed)
    .bind(context)
    .fetch_one(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// Fetch one checkpoint by ID.
pub async fn get_checkpoint(pool: &PgPool, id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>("SELECT * FROM checkpoints WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch checkpoint")?;

    Ok(checkpoint)
}

/// All checkpoints of a task, newest first.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE task_id = $1 ORDER BY triggered_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list checkpoints")?;

    Ok(checkpoints)
}

/// The most recent checkpoint of a task, if any. Drives the periodic
/// trigger's "completed since last checkpoint" arithmetic.
pub async fn latest_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE task_id = $1 \
         ORDER BY triggered_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest checkpoint")?;

    Ok(checkpoint)
}

/// Whether the task has a checkpoint awaiting review. While true, the
/// scheduler must not hand out new subtasks for the task.
pub async fn has_pending_review(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS( \
             SELECT 1 FROM checkpoints \
             WHERE task_id = $1 AND status = 'pending_review')",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to check for pending checkpoints")?;

    Ok(row.0)
}

/// Record the human decision. Optimistically locked on `pending_review` so
/// a decision can only be applied once; returns rows affected.
pub async fn record_decision(
    pool: &PgPool,
    id: Uuid,
    status: CheckpointStatus,
    decision: UserDecision,
    notes: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE checkpoints \
         SET status = $1, user_decision = $2, decision_notes = $3, reviewed_at = NOW() \
         WHERE id = $4 AND status = 'pending_review'",
    )
    .bind(status)
    .bind(decision)
    .bind(notes)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record checkpoint decision")?;

    Ok(result.rows_affected())
}

/// Append a line to the decision notes (rollback audit trail).
pub async fn append_notes(pool: &PgPool, id: Uuid, note: &str) -> Result<()> {
    sqlx::query(
        "UPDATE checkpoints \
         SET decision_notes = CASE \
             WHEN decision_notes IS NULL THEN $1 \
             ELSE decision_notes || E'\\n\\n' || $1 \
         END \
         WHERE id = $2",
    )
    .bind(note)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to append checkpoint notes")?;

    Ok(())
}

/// Delete checkpoints of a task triggered after the given instant
/// (rollback discards them). Returns rows deleted.
pub async fn delete_after(
    pool: &PgPool,
    task_id: Uuid,
    after: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM checkpoints WHERE task_id = $1 AND triggered_at > $2",
    )
    .bind(task_id)
    .bind(after)
    .execute(pool)
    .await
    .context("failed to delete later checkpoints")?;

    Ok(result.rows_affected())
}

/// Count checkpoints of a task triggered after the given instant.
pub async fn count_after(pool: &PgPool, task_id: Uuid, after: DateTime<Utc>) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM checkpoints WHERE task_id = $1 AND triggered_at > $2",
    )
    .bind(task_id)
    .bind(after)
    .fetch_one(pool)
    .await
    .context("failed to count later checkpoints")?;

    Ok(row.0)
}

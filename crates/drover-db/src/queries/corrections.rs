//! Database query functions for the `corrections` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Correction, CorrectionResult};

/// Fields for a new correction row.
#[derive(Debug, Clone)]
pub struct NewCorrection<'a> {
    pub checkpoint_id: Uuid,
    pub subtask_id: Uuid,
    pub correction_type: &'a str,
    pub guidance: &'a str,
    pub reference_files: &'a [String],
    pub apply_to_future: bool,
}

/// Insert a correction in `pending`.
pub async fn insert_correction(pool: &PgPool, new: &NewCorrection<'_>) -> Result<Correction> {
    let correction = sqlx::query_as::<_, Correction>(
        "INSERT INTO corrections \
         (checkpoint_id, subtask_id, correction_type, guidance, reference_files, apply_to_future) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.checkpoint_id)
    .bind(new.subtask_id)
    .bind(new.correction_type)
    .bind(new.guidance)
    .bind(new.reference_files)
    .bind(new.apply_to_future)
    .fetch_one(pool)
    .await
    .context("failed to insert correction")?;

    Ok(correction)
}

/// All corrections created by one checkpoint.
pub async fn list_for_checkpoint(pool: &PgPool, checkpoint_id: Uuid) -> Result<Vec<Correction>> {
    let corrections = sqlx::query_as::<_, Correction>(
        "SELECT * FROM corrections WHERE checkpoint_id = $1 ORDER BY created_at ASC",
    )
    .bind(checkpoint_id)
    .fetch_all(pool)
    .await
    .context("failed to list corrections")?;

    Ok(corrections)
}

/// Per-subtask counts of pending-or-failed corrections across all of a
/// task's checkpoints. Used by the cycle-limit trigger: any subtask at or
/// above the limit escalates.
pub async fn unresolved_counts_by_subtask(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Vec<(Uuid, i64)>> {
    let rows: Vec<(Uuid, i64)> = sqlx::query_as(
        "SELECT c.subtask_id, COUNT(*) \
         FROM corrections c \
         JOIN checkpoints cp ON cp.id = c.checkpoint_id \
         WHERE cp.task_id = $1 AND c.result IN ('pending', 'failed') \
         GROUP BY c.subtask_id",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to count unresolved corrections")?;

    Ok(rows)
}

/// Pending corrections for one subtask (resolved when its re-run uploads).
pub async fn pending_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<Correction>> {
    let corrections = sqlx::query_as::<_, Correction>(
        "SELECT * FROM corrections \
         WHERE subtask_id = $1 AND result = 'pending' \
         ORDER BY created_at ASC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending corrections")?;

    Ok(corrections)
}

/// Record the outcome of a correction, bumping its retry counter.
pub async fn set_result(pool: &PgPool, id: Uuid, result: CorrectionResult) -> Result<u64> {
    let outcome = sqlx::query(
        "UPDATE corrections \
         SET result = $1, retry_count = retry_count + 1 \
         WHERE id = $2",
    )
    .bind(result)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set correction result")?;

    Ok(outcome.rows_affected())
}

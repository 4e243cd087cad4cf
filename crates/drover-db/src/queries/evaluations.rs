//! Database query functions for the `evaluations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Evaluation;

/// Fields for a new evaluation row.
#[derive(Debug, Clone)]
pub struct NewEvaluation {
    pub subtask_id: Uuid,
    pub code_quality: Option<f64>,
    pub completeness: Option<f64>,
    pub security: Option<f64>,
    pub architecture: Option<f64>,
    pub testability: Option<f64>,
    pub overall_score: f64,
    pub details: serde_json::Value,
}

/// Insert an evaluation report.
pub async fn insert_evaluation(pool: &PgPool, new: &NewEvaluation) -> Result<Evaluation> {
    let evaluation = sqlx::query_as::<_, Evaluation>(
        "INSERT INTO evaluations \
         (subtask_id, code_quality, completeness, security, architecture, testability, overall_score, details) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(new.subtask_id)
    .bind(new.code_quality)
    .bind(new.completeness)
    .bind(new.security)
    .bind(new.architecture)
    .bind(new.testability)
    .bind(new.overall_score)
    .bind(&new.details)
    .fetch_one(pool)
    .await
    .context("failed to insert evaluation")?;

    Ok(evaluation)
}

/// The freshest evaluation for a subtask -- the authoritative score.
pub async fn latest_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Option<Evaluation>> {
    let evaluation = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations \
         WHERE subtask_id = $1 \
         ORDER BY evaluated_at DESC \
         LIMIT 1",
    )
    .bind(subtask_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest evaluation")?;

    Ok(evaluation)
}

/// Every evaluation recorded for a subtask, newest first.
pub async fn list_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<Vec<Evaluation>> {
    let evaluations = sqlx::query_as::<_, Evaluation>(
        "SELECT * FROM evaluations WHERE subtask_id = $1 ORDER BY evaluated_at DESC",
    )
    .bind(subtask_id)
    .fetch_all(pool)
    .await
    .context("failed to list evaluations")?;

    Ok(evaluations)
}

/// Delete all evaluations of a subtask (rollback). Returns rows deleted.
pub async fn delete_for_subtask(pool: &PgPool, subtask_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM evaluations WHERE subtask_id = $1")
        .bind(subtask_id)
        .execute(pool)
        .await
        .context("failed to delete evaluations")?;

    Ok(result.rows_affected())
}

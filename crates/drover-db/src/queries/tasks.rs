//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{CheckpointFrequency, PrivacyLevel, Task, TaskStatus};

/// Fields for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub description: &'a str,
    pub checkpoint_frequency: CheckpointFrequency,
    pub privacy_level: PrivacyLevel,
    pub tool_preferences: &'a [String],
    pub metadata: serde_json::Value,
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, status, progress).
pub async fn insert_task(pool: &PgPool, new: &NewTask<'_>) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (description, checkpoint_frequency, privacy_level, tool_preferences, metadata) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.description)
    .bind(new.checkpoint_frequency)
    .bind(new.privacy_level)
    .bind(new.tool_preferences)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List tasks, newest first, with optional status filter and pagination.
pub async fn list_tasks(
    pool: &PgPool,
    status: Option<TaskStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Task>> {
    let tasks = match status {
        Some(status) => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks WHERE status = $1 \
                 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
            )
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Task>(
                "SELECT * FROM tasks ORDER BY created_at DESC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Tasks the scheduler must look at: `initializing` or `in_progress`,
/// oldest first (FIFO across tasks).
pub async fn list_active_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('initializing', 'in_progress') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list active tasks")?;

    Ok(tasks)
}

/// Count tasks in the scheduler-active statuses.
pub async fn count_active_tasks(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE status IN ('initializing', 'in_progress')",
    )
    .fetch_one(pool)
    .await
    .context("failed to count active tasks")?;

    Ok(row.0)
}

/// Unconditionally set the status of a task.
pub async fn update_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches. Returns the number of rows affected (0 means the status did not
/// match or the task does not exist).
pub async fn transition_task_status(
    pool: &PgPool,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Set the progress column.
pub async fn set_task_progress(pool: &PgPool, id: Uuid, progress: i32) -> Result<()> {
    sqlx::query("UPDATE tasks SET progress = $1 WHERE id = $2")
        .bind(progress)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set task progress")?;

    Ok(())
}

/// Move a task to a terminal status (completed/failed) with its final
/// progress and completion timestamp.
pub async fn finish_task(
    pool: &PgPool,
    id: Uuid,
    status: TaskStatus,
    progress: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, progress = $2, completed_at = NOW() \
         WHERE id = $3 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(status)
    .bind(progress)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish task")?;

    Ok(result.rows_affected())
}

/// Cancel a task unless it is already terminal. Returns rows affected.
pub async fn cancel_task(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'cancelled', completed_at = NOW() \
         WHERE id = $1 AND status NOT IN ('completed', 'failed', 'cancelled')",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    Ok(result.rows_affected())
}

/// Reopen a task after a checkpoint decision or rollback: status back to
/// `in_progress`, terminal timestamp cleared, progress replaced.
pub async fn reopen_task(pool: &PgPool, id: Uuid, progress: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'in_progress', progress = $1, completed_at = NULL \
         WHERE id = $2",
    )
    .bind(progress)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to reopen task")?;

    Ok(result.rows_affected())
}

/// Shallow-merge keys into the task's metadata JSONB.
pub async fn merge_task_metadata(
    pool: &PgPool,
    id: Uuid,
    patch: &serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET metadata = metadata || $1 WHERE id = $2")
        .bind(patch)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to merge task metadata")?;

    Ok(())
}

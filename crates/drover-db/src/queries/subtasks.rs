//! Database query functions for the `subtasks` table, including the
//! ready-set computation and the grouped status aggregation the scheduler
//! relies on.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Subtask, SubtaskStatus, SubtaskType};

/// Fields for a new subtask row.
#[derive(Debug, Clone)]
pub struct NewSubtask<'a> {
    pub task_id: Uuid,
    pub name: &'a str,
    pub description: &'a str,
    pub subtask_type: SubtaskType,
    pub recommended_tool: Option<&'a str>,
    pub complexity: i32,
    pub priority: i32,
    pub dependencies: &'a [Uuid],
    pub output: Option<serde_json::Value>,
}

/// Insert a new subtask row.
pub async fn insert_subtask(pool: &PgPool, new: &NewSubtask<'_>) -> Result<Subtask> {
    let subtask = sqlx::query_as::<_, Subtask>(
        "INSERT INTO subtasks \
         (task_id, name, description, subtask_type, recommended_tool, complexity, priority, dependencies, output) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.name)
    .bind(new.description)
    .bind(new.subtask_type)
    .bind(new.recommended_tool)
    .bind(new.complexity)
    .bind(new.priority)
    .bind(new.dependencies)
    .bind(&new.output)
    .fetch_one(pool)
    .await
    .context("failed to insert subtask")?;

    Ok(subtask)
}

/// Fetch a single subtask by ID.
pub async fn get_subtask(pool: &PgPool, id: Uuid) -> Result<Option<Subtask>> {
    let subtask = sqlx::query_as::<_, Subtask>("SELECT * FROM subtasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch subtask")?;

    Ok(subtask)
}

/// All subtasks for a task, ordered by creation time. This is the single
/// round-trip eager load used by task detail views and the scheduler.
pub async fn list_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list subtasks for task")?;

    Ok(subtasks)
}

/// Count subtasks belonging to a task.
pub async fn count_for_task(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM subtasks WHERE task_id = $1")
        .bind(task_id)
        .fetch_one(pool)
        .await
        .context("failed to count subtasks")?;

    Ok(row.0)
}

/// Replace the dependency list of a subtask (decomposer second pass).
pub async fn set_dependencies(pool: &PgPool, id: Uuid, dependencies: &[Uuid]) -> Result<()> {
    sqlx::query("UPDATE subtasks SET dependencies = $1 WHERE id = $2")
        .bind(dependencies)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set subtask dependencies")?;

    Ok(())
}

/// Ready subtasks for a task: `pending` with every dependency `completed`,
/// in allocation order (priority desc, created_at asc).
///
/// A dependency id that does not resolve to a completed sibling keeps the
/// subtask out of the ready set.
pub async fn ready_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT s.* FROM subtasks s \
         WHERE s.task_id = $1 \
           AND s.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM unnest(s.dependencies) AS dep_id \
               WHERE dep_id NOT IN ( \
                   SELECT c.id FROM subtasks c \
                   WHERE c.task_id = s.task_id AND c.status = 'completed' \
               ) \
           ) \
         ORDER BY s.priority DESC, s.created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to compute ready subtasks")?;

    Ok(subtasks)
}

/// IDs of completed subtasks for a task (checkpoint snapshots).
pub async fn completed_ids_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM subtasks WHERE task_id = $1 AND status = 'completed' \
         ORDER BY completed_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch completed subtask ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Queued subtasks with no assigned worker, in allocation order. A `None`
/// limit fetches them all (queue rebuilds).
pub async fn queued_unassigned(pool: &PgPool, limit: Option<i64>) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks \
         WHERE status = 'queued' AND assigned_worker IS NULL \
         ORDER BY priority DESC, created_at ASC \
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list queued subtasks")?;

    Ok(subtasks)
}

/// Status counts for a task's subtasks via a single grouped query.
#[derive(Debug, Clone, Default)]
pub struct SubtaskStatusCounts {
    pub pending: i64,
    pub queued: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub correcting: i64,
    pub total: i64,
}

impl SubtaskStatusCounts {
    /// Task progress derived from these counts: `floor(100 * completed /
    /// total)`, or 0 for an empty DAG.
    pub fn progress(&self) -> i32 {
        if self.total == 0 {
            0
        } else {
            ((self.completed * 100) / self.total) as i32
        }
    }
}

/// Get subtask counts by status for one task in a single round-trip.
pub async fn status_counts(pool: &PgPool, task_id: Uuid) -> Result<SubtaskStatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM subtasks \
         WHERE task_id = $1 \
         GROUP BY status",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get subtask status counts")?;

    let mut counts = SubtaskStatusCounts::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => counts.pending = *count,
            "queued" => counts.queued = *count,
            "in_progress" => counts.in_progress = *count,
            "completed" => counts.completed = *count,
            "failed" => counts.failed = *count,
            "cancelled" => counts.cancelled = *count,
            "correcting" => counts.correcting = *count,
            _ => {}
        }
        counts.total += count;
    }
    Ok(counts)
}

/// System-wide subtask counts by status (scheduler stats).
pub async fn global_status_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) FROM subtasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to get global subtask status counts")?;

    Ok(rows)
}

/// System-wide count of subtasks currently `in_progress` (database fallback
/// for the coordinator's in-progress set).
pub async fn in_progress_count(pool: &PgPool) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subtasks WHERE status = 'in_progress'")
            .fetch_one(pool)
            .await
            .context("failed to count in-progress subtasks")?;

    Ok(row.0)
}

/// Atomically transition a subtask between statuses with optimistic locking.
/// Returns rows affected (0 = current status did not match `from`).
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from: SubtaskStatus,
    to: SubtaskStatus,
) -> Result<u64> {
    let result = sqlx::query("UPDATE subtasks SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition subtask status")?;

    Ok(result.rows_affected())
}

/// Unconditionally set a subtask's status (checkpoint corrections,
/// escalations).
pub async fn set_status(pool: &PgPool, id: Uuid, status: SubtaskStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE subtasks SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set subtask status")?;

    Ok(result.rows_affected())
}

/// Assignment step of the allocation protocol: bind the worker and tool and
/// move the subtask to `queued`. Guarded so a concurrently-assigned subtask
/// is not stolen.
pub async fn assign_to_worker(
    pool: &PgPool,
    id: Uuid,
    worker_id: Uuid,
    tool: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET assigned_worker = $1, assigned_tool = $2, status = 'queued' \
         WHERE id = $3 AND status IN ('pending', 'queued') AND assigned_worker IS NULL",
    )
    .bind(worker_id)
    .bind(tool)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to assign subtask to worker")?;

    Ok(result.rows_affected())
}

/// Move a queued subtask to `in_progress` and stamp `started_at`. Called
/// when the worker acknowledges the assignment.
pub async fn start_execution(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'in_progress', started_at = NOW() \
         WHERE id = $1 AND status = 'queued'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to start subtask execution")?;

    Ok(result.rows_affected())
}

/// Persist a worker-reported result. Only subtasks in `in_progress` or
/// `queued` accept results; anything else returns 0 rows so the caller can
/// reject the upload as a bad-state error (this is what makes result upload
/// idempotent under at-least-once delivery).
pub async fn record_result(
    pool: &PgPool,
    id: Uuid,
    status: SubtaskStatus,
    output: &serde_json::Value,
    error: Option<&str>,
    progress: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = $1, output = $2, error = $3, progress = $4, completed_at = NOW() \
         WHERE id = $5 AND status IN ('in_progress', 'queued')",
    )
    .bind(status)
    .bind(output)
    .bind(error)
    .bind(progress)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record subtask result")?;

    Ok(result.rows_affected())
}

/// Cancel every non-terminal subtask of a task; returns the affected ids.
pub async fn cancel_nonterminal_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE subtasks \
         SET status = 'cancelled' \
         WHERE task_id = $1 \
           AND status IN ('pending', 'queued', 'in_progress', 'correcting') \
         RETURNING id",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to cancel subtasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Cancel only pending/queued subtasks of a task (checkpoint rejection);
/// in-flight executions are left to finish and get rejected on upload.
pub async fn cancel_unstarted_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE subtasks \
         SET status = 'cancelled' \
         WHERE task_id = $1 AND status IN ('pending', 'queued') \
         RETURNING id",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to cancel unstarted subtasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Rollback reset: return a completed subtask to a clean `pending` state.
pub async fn reset_to_pending(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks \
         SET status = 'pending', \
             progress = 0, \
             output = NULL, \
             error = NULL, \
             started_at = NULL, \
             completed_at = NULL, \
             assigned_worker = NULL, \
             assigned_tool = NULL \
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to reset subtask")?;

    Ok(result.rows_affected())
}

/// Clear the worker binding of a subtask without touching its status
/// (used when re-issuing `correcting` work).
pub async fn clear_assignment(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE subtasks SET assigned_worker = NULL, assigned_tool = NULL WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to clear subtask assignment")?;

    Ok(result.rows_affected())
}

/// Shallow-merge keys into a subtask's output JSONB (creates the object
/// when output is NULL).
pub async fn merge_output(pool: &PgPool, id: Uuid, patch: &serde_json::Value) -> Result<()> {
    sqlx::query("UPDATE subtasks SET output = COALESCE(output, '{}'::jsonb) || $1 WHERE id = $2")
        .bind(patch)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to merge subtask output")?;

    Ok(())
}

/// Subtasks of a task filtered to one type (review-chain queries).
pub async fn list_for_task_by_type(
    pool: &PgPool,
    task_id: Uuid,
    subtask_type: SubtaskType,
) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks \
         WHERE task_id = $1 AND subtask_type = $2 \
         ORDER BY created_at ASC",
    )
    .bind(task_id)
    .bind(subtask_type)
    .fetch_all(pool)
    .await
    .context("failed to list subtasks by type")?;

    Ok(subtasks)
}

/// Subtasks in `in_progress` or `queued` across all tasks (mirror rebuild).
pub async fn list_live(pool: &PgPool) -> Result<Vec<Subtask>> {
    let subtasks = sqlx::query_as::<_, Subtask>(
        "SELECT * FROM subtasks WHERE status IN ('in_progress', 'queued') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list live subtasks")?;

    Ok(subtasks)
}

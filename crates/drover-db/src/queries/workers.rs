//! Database query functions for the `workers` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Worker, WorkerStatus};

/// Insert a worker or, if the machine_id is already registered, update the
/// existing row and bring it back online. Registration is idempotent on
/// `machine_id`.
pub async fn upsert_worker(
    pool: &PgPool,
    machine_id: &str,
    machine_name: &str,
    system_info: &serde_json::Value,
    tools: &[String],
) -> Result<Worker> {
    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (machine_id, machine_name, system_info, tools, status) \
         VALUES ($1, $2, $3, $4, 'online') \
         ON CONFLICT (machine_id) DO UPDATE \
         SET machine_name = EXCLUDED.machine_name, \
             system_info = EXCLUDED.system_info, \
             tools = EXCLUDED.tools, \
             status = 'online' \
         RETURNING *",
    )
    .bind(machine_id)
    .bind(machine_name)
    .bind(system_info)
    .bind(tools)
    .fetch_one(pool)
    .await
    .context("failed to upsert worker")?;

    Ok(worker)
}

/// Fetch a single worker by ID.
pub async fn get_worker(pool: &PgPool, id: Uuid) -> Result<Option<Worker>> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker")?;

    Ok(worker)
}

/// List workers with optional status filter and pagination. Returns the
/// page plus the total count matching the filter.
pub async fn list_workers(
    pool: &PgPool,
    status: Option<WorkerStatus>,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Worker>, i64)> {
    let (workers, total) = match status {
        Some(status) => {
            let workers = sqlx::query_as::<_, Worker>(
                "SELECT * FROM workers WHERE status = $1 \
                 ORDER BY registered_at ASC LIMIT $2 OFFSET $3",
            )
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
            .context("failed to list workers")?;

            let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workers WHERE status = $1")
                .bind(status)
                .fetch_one(pool)
                .await
                .context("failed to count workers")?;

            (workers, row.0)
        }
        None => {
            let workers = sqlx::query_as::<_, Worker>(
                "SELECT * FROM workers ORDER BY registered_at ASC LIMIT $1 OFFSET $2",
            )
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
            .context("failed to list workers")?;

            let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workers")
                .fetch_one(pool)
                .await
                .context("failed to count workers")?;

            (workers, row.0)
        }
    };

    Ok((workers, total))
}

/// Workers in an assignable status (`online` or `idle`), id ascending so
/// allocation tie-breaks are deterministic.
pub async fn list_assignable(pool: &PgPool) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers WHERE status IN ('online', 'idle') ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list assignable workers")?;

    Ok(workers)
}

/// Apply a heartbeat: status, resource usage, and `last_heartbeat = NOW()`.
/// Returns rows affected (0 = unknown worker).
pub async fn apply_heartbeat(
    pool: &PgPool,
    id: Uuid,
    status: WorkerStatus,
    cpu_percent: Option<f32>,
    memory_percent: Option<f32>,
    disk_percent: Option<f32>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workers \
         SET status = $1, cpu_percent = $2, memory_percent = $3, disk_percent = $4, \
             last_heartbeat = NOW() \
         WHERE id = $5",
    )
    .bind(status)
    .bind(cpu_percent)
    .bind(memory_percent)
    .bind(disk_percent)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to apply worker heartbeat")?;

    Ok(result.rows_affected())
}

/// Set a worker's status. Returns rows affected.
pub async fn set_worker_status(pool: &PgPool, id: Uuid, status: WorkerStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE workers SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set worker status")?;

    Ok(result.rows_affected())
}

/// Mark every worker whose last sign of life predates `cutoff` as offline.
/// Workers that never heartbeated are judged by their registration time.
/// Returns the workers that were transitioned.
pub async fn mark_stale_offline(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "UPDATE workers \
         SET status = 'offline' \
         WHERE status != 'offline' \
           AND COALESCE(last_heartbeat, registered_at) < $1 \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to mark stale workers offline")?;

    Ok(workers)
}

/// Workers with a recent heartbeat in a live status (mirror rebuild).
pub async fn list_live_since(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<Vec<Worker>> {
    let workers = sqlx::query_as::<_, Worker>(
        "SELECT * FROM workers \
         WHERE status IN ('online', 'idle', 'busy') \
           AND COALESCE(last_heartbeat, registered_at) >= $1 \
         ORDER BY id ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list live workers")?;

    Ok(workers)
}

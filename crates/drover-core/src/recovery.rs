//! Startup recovery: rebuild the coordination mirrors from the store.
//!
//! Mirrors are caches; the store is authoritative. On a cold start the
//! in-memory coordination layer is empty, so this pass re-derives worker
//! statuses, worker slots, the in-progress set, the pending queue, and
//! task status/progress keys from durable state.

use anyhow::Result;
use sqlx::PgPool;

use drover_db::models::WorkerStatus;
use drover_db::queries::subtasks as subtask_db;
use drover_db::queries::tasks as task_db;
use drover_db::queries::workers as worker_db;

use crate::config::ControlConfig;
use crate::coordination::Coordination;

/// Counts of what the rebuild restored.
#[derive(Debug, Clone, Default)]
pub struct RebuildStats {
    pub workers: usize,
    pub busy_workers: usize,
    pub live_subtasks: usize,
    pub queued: usize,
    pub active_tasks: usize,
}

/// Rebuild every mirror from the store.
pub async fn rebuild_mirrors(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
) -> Result<RebuildStats> {
    tracing::info!("rebuilding coordination mirrors from the store");
    let mut stats = RebuildStats::default();

    // Workers with a recent sign of life keep their status mirror; anyone
    // older than the heartbeat timeout is left to the reaper.
    let timeout = chrono::Duration::from_std(config.heartbeat_timeout)
        .unwrap_or_else(|_| chrono::Duration::seconds(90));
    let cutoff = chrono::Utc::now() - timeout;

    for worker in worker_db::list_live_since(pool, cutoff).await? {
        coord
            .set_worker_status(worker.id, worker.status, config.worker_status_ttl())
            .await?;
        stats.workers += 1;
    }

    // Live subtasks: status mirrors, the in-progress set, worker slots.
    for subtask in subtask_db::list_live(pool).await? {
        coord.set_subtask_status(subtask.id, subtask.status).await?;
        stats.live_subtasks += 1;

        if let Some(worker_id) = subtask.assigned_worker {
            coord.mark_in_progress(subtask.id).await?;
            coord
                .set_worker_current_task(worker_id, subtask.task_id)
                .await?;
            coord
                .set_worker_status(worker_id, WorkerStatus::Busy, config.worker_status_ttl())
                .await?;
            stats.busy_workers += 1;
        }
    }

    // The pending queue is rebuilt from the store in allocation order.
    // This also re-absorbs entries the drain discarded while their task
    // sat at a checkpoint.
    for subtask in subtask_db::queued_unassigned(pool, None).await? {
        coord.push_to_queue(subtask.id).await?;
        stats.queued += 1;
    }

    // Active tasks: status and progress keys.
    for task in task_db::list_active_tasks(pool).await? {
        coord.set_task_status(task.id, task.status).await?;
        coord.set_task_progress(task.id, task.progress).await?;
        stats.active_tasks += 1;
    }

    tracing::info!(
        workers = stats.workers,
        busy = stats.busy_workers,
        live_subtasks = stats.live_subtasks,
        queued = stats.queued,
        active_tasks = stats.active_tasks,
        "coordination mirrors rebuilt"
    );

    Ok(stats)
}

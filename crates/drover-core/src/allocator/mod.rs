//! Worker allocation: weighted scoring, the assignment protocol, worker
//! release, and the bounded queue-drain pass.

pub mod scoring;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Subtask, SubtaskStatus, TaskStatus, Worker, WorkerStatus};
use drover_db::queries::subtasks as subtask_db;
use drover_db::queries::tasks as task_db;
use drover_db::queries::workers as worker_db;

use crate::config::ControlConfig;
use crate::coordination::Coordination;
use crate::coordination::events::TaskAssignment;
use crate::error::{ControlError, ControlResult};
use scoring::Weights;

/// Allocate one subtask to the best available worker.
///
/// Returns `Ok(Some(worker))` on assignment, `Ok(None)` when the subtask
/// was queued instead (no available worker, or best score <= 0). Bad-state
/// inputs (already assigned, not pending/queued) are errors.
pub async fn allocate_subtask(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    subtask_id: Uuid,
) -> ControlResult<Option<Worker>> {
    tracing::info!(subtask_id = %subtask_id, "allocating subtask");

    let subtask = subtask_db::get_subtask(pool, subtask_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("subtask {subtask_id}")))?;

    if subtask.assigned_worker.is_some() {
        return Err(ControlError::bad_state(format!(
            "subtask {subtask_id} is already assigned"
        )));
    }
    if !matches!(
        subtask.status,
        SubtaskStatus::Pending | SubtaskStatus::Queued
    ) {
        return Err(ControlError::bad_state(format!(
            "subtask {subtask_id} is not in allocatable state: {}",
            subtask.status
        )));
    }

    let task = task_db::get_task(pool, subtask.task_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("task {}", subtask.task_id)))?;

    // A paused or finished task hands out nothing: while a checkpoint is
    // pending review no subtask of the task may leave pending/queued.
    if task.status == TaskStatus::Checkpoint || task.status.is_terminal() {
        return Err(ControlError::bad_state(format!(
            "task {} is {}, not accepting allocations",
            task.id, task.status
        )));
    }

    // No subtask reaches a worker before its dependencies complete, even
    // through the manual allocation endpoint.
    let completed: std::collections::HashSet<Uuid> =
        subtask_db::completed_ids_for_task(pool, subtask.task_id)
            .await?
            .into_iter()
            .collect();
    if !subtask.deps_satisfied(&completed) {
        return Err(ControlError::bad_state(format!(
            "subtask {subtask_id} has incomplete dependencies"
        )));
    }

    // System-wide concurrency cap, enforced on every allocation path
    // (cycles, completion hooks, manual calls, queue drains alike).
    let in_progress = coord
        .in_progress_count()
        .await
        .map_err(ControlError::Internal)?;
    if in_progress >= config.max_concurrent_subtasks {
        tracing::info!(
            subtask_id = %subtask_id,
            in_progress,
            max = config.max_concurrent_subtasks,
            "system at max capacity, queueing"
        );
        queue_subtask(pool, coord, &subtask).await?;
        return Ok(None);
    }

    let available = available_workers(pool, coord).await?;
    if available.is_empty() {
        tracing::info!(subtask_id = %subtask_id, "no available workers");
        queue_subtask(pool, coord, &subtask).await?;
        return Ok(None);
    }

    // Score every candidate; best total wins, ties broken by lowest
    // combined resource usage, then worker id.
    let weights = Weights::from_config(config);
    let mut scored: Vec<(f64, f64, &Worker)> = available
        .iter()
        .map(|w| {
            let score = scoring::worker_score(
                weights,
                w,
                subtask.recommended_tool.as_deref(),
                task.privacy_level,
            );
            (score, scoring::combined_usage(w), w)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.2.id.cmp(&b.2.id))
    });

    let (best_score, _, best) = scored[0];
    if best_score <= 0.0 {
        tracing::info!(
            subtask_id = %subtask_id,
            best_score,
            "no suitable worker, queueing"
        );
        queue_subtask(pool, coord, &subtask).await?;
        return Ok(None);
    }

    let best = (*best).clone();
    warn_if_overloaded(config, &best);
    assign_subtask_to_worker(pool, coord, &subtask, &task.description, &best).await?;

    tracing::info!(
        subtask_id = %subtask_id,
        worker_id = %best.id,
        score = best_score,
        "subtask allocated"
    );

    Ok(Some(best))
}

/// Allocate every ready subtask of a task; returns per-subtask outcomes.
pub async fn allocate_ready_subtasks(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task_id: Uuid,
) -> Result<Vec<(Subtask, Option<Worker>)>> {
    let ready = subtask_db::ready_for_task(pool, task_id).await?;

    let mut outcomes = Vec::with_capacity(ready.len());
    for subtask in ready {
        match allocate_subtask(pool, coord, config, subtask.id).await {
            Ok(worker) => outcomes.push((subtask, worker)),
            Err(e) => {
                tracing::warn!(
                    subtask_id = %subtask.id,
                    error = %e,
                    "failed to allocate ready subtask"
                );
                outcomes.push((subtask, None));
            }
        }
    }
    Ok(outcomes)
}

/// Drain the pending queue: peek, try to allocate, pop on success, discard
/// non-allocatable entries, stop when no worker qualifies. Bounded by
/// `max_queue_allocation_attempts` per call.
pub async fn reallocate_queued(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
) -> Result<usize> {
    tracing::debug!("reallocating queued subtasks");

    let mut allocated = 0;
    let mut attempts = 0;

    while attempts < config.max_queue_allocation_attempts {
        attempts += 1;

        let Some(head) = coord.peek_queue().await? else {
            break;
        };

        let Ok(subtask_id) = head.parse::<Uuid>() else {
            tracing::warn!(entry = %head, "dropping malformed queue entry");
            coord.pop_from_queue().await?;
            continue;
        };

        match allocate_subtask(pool, coord, config, subtask_id).await {
            Ok(Some(_)) => {
                let popped = coord.pop_from_queue().await?;
                if popped.as_deref() != Some(head.as_str()) {
                    tracing::warn!(
                        expected = %head,
                        got = ?popped,
                        "queue head changed during reallocation"
                    );
                }
                allocated += 1;
            }
            Ok(None) => {
                // No worker right now; later entries would fare no better.
                break;
            }
            Err(ControlError::NotFound(_)) | Err(ControlError::BadState(_)) => {
                tracing::warn!(
                    subtask_id = %subtask_id,
                    "removing non-allocatable subtask from queue"
                );
                coord.pop_from_queue().await?;
            }
            Err(e) => {
                tracing::error!(subtask_id = %subtask_id, error = %e, "error during reallocation");
                // Pop so one poisoned entry cannot wedge the queue.
                coord.pop_from_queue().await?;
            }
        }
    }

    tracing::debug!(attempts, allocated, "reallocation pass complete");
    Ok(allocated)
}

/// Release a worker after its subtask finished: online in the store,
/// slot and status mirrors cleared.
pub async fn release_worker(pool: &PgPool, coord: &Coordination, worker_id: Uuid) -> Result<()> {
    tracing::info!(worker_id = %worker_id, "releasing worker");

    worker_db::set_worker_status(pool, worker_id, WorkerStatus::Online).await?;
    coord.clear_worker_current_task(worker_id).await?;
    coord
        .set_worker_status(
            worker_id,
            WorkerStatus::Online,
            std::time::Duration::from_secs(120),
        )
        .await?;

    Ok(())
}

/// Queue a subtask: `status = queued` plus a coordinator queue entry.
/// A subtask already queued is not re-pushed.
async fn queue_subtask(pool: &PgPool, coord: &Coordination, subtask: &Subtask) -> Result<()> {
    if subtask.status != SubtaskStatus::Queued {
        subtask_db::transition_status(pool, subtask.id, subtask.status, SubtaskStatus::Queued)
            .await?;
        coord.push_to_queue(subtask.id).await?;
        coord
            .set_subtask_status(subtask.id, SubtaskStatus::Queued)
            .await?;
    }
    Ok(())
}

/// Workers eligible for assignment: assignable status in the store AND no
/// current task in the coordinator. The slot check is one batch call.
async fn available_workers(pool: &PgPool, coord: &Coordination) -> Result<Vec<Worker>> {
    let workers = worker_db::list_assignable(pool).await?;
    if workers.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<Uuid> = workers.iter().map(|w| w.id).collect();
    let current_tasks = coord.worker_current_tasks(&ids).await?;

    let available: Vec<Worker> = workers
        .into_iter()
        .filter(|w| {
            current_tasks
                .get(&w.id)
                .map(|t| t.is_none())
                .unwrap_or(true)
        })
        .collect();

    tracing::debug!(available = available.len(), "available workers check");
    Ok(available)
}

/// The assignment protocol. Store commit first (worker binding + queued
/// status), then the coordination mirrors and the push message.
async fn assign_subtask_to_worker(
    pool: &PgPool,
    coord: &Coordination,
    subtask: &Subtask,
    task_description: &str,
    worker: &Worker,
) -> ControlResult<()> {
    let assigned_tool = subtask
        .recommended_tool
        .clone()
        .or_else(|| worker.tools.first().cloned());

    let rows =
        subtask_db::assign_to_worker(pool, subtask.id, worker.id, assigned_tool.as_deref()).await?;
    if rows == 0 {
        return Err(ControlError::bad_state(format!(
            "subtask {} was assigned concurrently",
            subtask.id
        )));
    }

    worker_db::set_worker_status(pool, worker.id, WorkerStatus::Busy).await?;

    // Mirrors after the commit; the store stays authoritative.
    coord
        .set_worker_current_task(worker.id, subtask.task_id)
        .await
        .map_err(ControlError::Internal)?;
    coord
        .set_worker_status(
            worker.id,
            WorkerStatus::Busy,
            std::time::Duration::from_secs(120),
        )
        .await
        .map_err(ControlError::Internal)?;
    coord
        .mark_in_progress(subtask.id)
        .await
        .map_err(ControlError::Internal)?;
    coord
        .set_subtask_status(subtask.id, SubtaskStatus::Queued)
        .await
        .map_err(ControlError::Internal)?;

    let assignment = TaskAssignment {
        subtask_id: subtask.id,
        task_id: subtask.task_id,
        description: subtask.description.clone(),
        assigned_tool,
        input_data: serde_json::json!({
            "subtask_name": subtask.name,
            "subtask_type": subtask.subtask_type,
            "task_description": task_description,
            "input": subtask.output,
        }),
    };
    coord
        .push_task_assignment(worker.id, assignment)
        .await
        .map_err(ControlError::Internal)?;

    Ok(())
}

fn warn_if_overloaded(config: &ControlConfig, worker: &Worker) {
    let over = |usage: Option<f32>, limit: f64| usage.map(|u| f64::from(u) > limit).unwrap_or(false);

    if over(worker.cpu_percent, config.resource_threshold_cpu_high)
        || over(worker.memory_percent, config.resource_threshold_memory_high)
        || over(worker.disk_percent, config.resource_threshold_disk_high)
    {
        tracing::warn!(
            worker_id = %worker.id,
            cpu = ?worker.cpu_percent,
            memory = ?worker.memory_percent,
            disk = ?worker.disk_percent,
            "assigning to a worker above a high-usage threshold"
        );
    }
}

//! The scheduler: periodic cycles plus event-driven completion hooks.
//!
//! A cycle promotes ready subtasks to workers under the system-wide
//! concurrency cap, FIFO across tasks and (priority desc, created_at asc)
//! within a task, then drains the pending queue. Cycles are serialised
//! across processes by a coordination lock.

pub mod levels;
pub mod runner;

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{SubtaskStatus, Task, TaskStatus};
use drover_db::queries::corrections as correction_db;
use drover_db::queries::subtasks as subtask_db;
use drover_db::queries::tasks as task_db;

use crate::allocator;
use crate::config::ControlConfig;
use crate::coordination::Coordination;
use crate::coordination::events::Event;
use crate::decomposer;
use crate::error::{ControlError, ControlResult};

/// Name of the coordination lock serialising scheduler cycles.
const SCHEDULER_LOCK: &str = "scheduler";

/// Outcome of one scheduling cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleResult {
    pub tasks_processed: usize,
    pub subtasks_allocated: usize,
    pub subtasks_queued: usize,
    pub errors: Vec<CycleError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A per-task failure collected during a cycle. One task's failure never
/// aborts the cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleError {
    pub task_id: Option<Uuid>,
    pub error: String,
}

/// Outcome of scheduling one specific task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskScheduleResult {
    pub task_id: Uuid,
    pub subtasks_allocated: usize,
    pub subtasks_queued: usize,
}

/// Outcome of the on-completion hook.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionResult {
    pub newly_allocated: usize,
    pub task_completed: bool,
}

/// Run one scheduling cycle under the cross-process lock.
///
/// When another process holds the lock the cycle is skipped with a message
/// rather than an error.
pub async fn run_cycle(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
) -> Result<CycleResult> {
    let lock_ttl = config.scheduler_interval * 2;
    let holder = format!("scheduler-{}", std::process::id());

    if !coord.acquire_lock(SCHEDULER_LOCK, &holder, lock_ttl).await? {
        tracing::debug!("scheduler lock held elsewhere, skipping cycle");
        return Ok(CycleResult {
            message: Some("scheduler lock held by another process".into()),
            ..CycleResult::default()
        });
    }

    let result = run_cycle_locked(pool, coord, config).await;

    if let Err(e) = coord.release_lock(SCHEDULER_LOCK).await {
        tracing::warn!(error = %e, "failed to release scheduler lock");
    }

    result
}

async fn run_cycle_locked(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
) -> Result<CycleResult> {
    tracing::info!("starting scheduling cycle");
    let mut result = CycleResult::default();

    // 1. Capacity short-circuit.
    let mut in_progress = current_in_progress(pool, coord).await?;
    if in_progress >= config.max_concurrent_subtasks {
        tracing::info!(
            in_progress,
            max = config.max_concurrent_subtasks,
            "system at max capacity"
        );
        result.message = Some("system at max capacity".into());
        return Ok(result);
    }

    // 2. Active tasks, FIFO by creation time.
    let active = task_db::list_active_tasks(pool).await?;
    result.tasks_processed = active.len();

    // 3. Per-task scheduling; errors are collected, never fatal.
    for task in &active {
        match schedule_one(pool, coord, config, task, &mut in_progress).await {
            Ok((allocated, queued)) => {
                result.subtasks_allocated += allocated;
                result.subtasks_queued += queued;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "error scheduling task");
                result.errors.push(CycleError {
                    task_id: Some(task.id),
                    error: e.to_string(),
                });
            }
        }
    }

    // 4. Drain queue leftovers from earlier cycles.
    match allocator::reallocate_queued(pool, coord, config).await {
        Ok(reallocated) => result.subtasks_allocated += reallocated,
        Err(e) => {
            tracing::error!(error = %e, "error reallocating queued subtasks");
            result.errors.push(CycleError {
                task_id: None,
                error: e.to_string(),
            });
        }
    }

    tracing::info!(
        allocated = result.subtasks_allocated,
        queued = result.subtasks_queued,
        errors = result.errors.len(),
        "scheduling cycle complete"
    );

    Ok(result)
}

/// Schedule one specific task, decomposing it first when still `pending`.
pub async fn schedule_task(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task_id: Uuid,
) -> ControlResult<TaskScheduleResult> {
    let mut task = task_db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("task {task_id}")))?;

    if task.status == TaskStatus::Pending {
        decomposer::decompose_task(pool, coord, task_id).await?;
        task = task_db::get_task(pool, task_id)
            .await?
            .ok_or_else(|| ControlError::not_found(format!("task {task_id}")))?;
    }

    let mut in_progress = current_in_progress(pool, coord).await?;
    let (allocated, queued) = schedule_one(pool, coord, config, &task, &mut in_progress).await?;

    Ok(TaskScheduleResult {
        task_id,
        subtasks_allocated: allocated,
        subtasks_queued: queued,
    })
}

/// Promote a task's ready subtasks. Allocation order inside the task is
/// (priority desc, created_at asc) straight from the ready query. Ready
/// work past the system cap is queued, not assigned.
async fn schedule_one(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task: &Task,
    in_progress: &mut usize,
) -> Result<(usize, usize)> {
    // Re-issue corrected subtasks before computing the ready set, so the
    // same cycle can hand them back out.
    reissue_correcting(pool, coord, task.id).await?;

    let ready = decomposer::ready_subtasks(pool, task.id).await?;
    if ready.is_empty() {
        return Ok((0, 0));
    }

    let mut allocated = 0;
    let mut queued = 0;

    for subtask in &ready {
        if *in_progress >= config.max_concurrent_subtasks {
            // Over the cap: queue, do not assign.
            if subtask.status == SubtaskStatus::Pending {
                subtask_db::transition_status(
                    pool,
                    subtask.id,
                    SubtaskStatus::Pending,
                    SubtaskStatus::Queued,
                )
                .await?;
                coord.push_to_queue(subtask.id).await?;
                coord
                    .set_subtask_status(subtask.id, SubtaskStatus::Queued)
                    .await?;
            }
            queued += 1;
            continue;
        }

        match allocator::allocate_subtask(pool, coord, config, subtask.id).await {
            Ok(Some(_)) => {
                allocated += 1;
                *in_progress += 1;
            }
            Ok(None) => queued += 1,
            Err(ControlError::BadState(msg)) => {
                tracing::debug!(subtask_id = %subtask.id, %msg, "subtask skipped");
                queued += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    // First successful allocation moves an initializing task into flight.
    if task.status == TaskStatus::Initializing && allocated > 0 {
        let rows = task_db::transition_task_status(
            pool,
            task.id,
            TaskStatus::Initializing,
            TaskStatus::InProgress,
            Some(chrono::Utc::now()),
            None,
        )
        .await?;
        if rows > 0 {
            coord.set_task_status(task.id, TaskStatus::InProgress).await?;
            coord
                .publish_event(&Event::task_update(
                    task.id,
                    TaskStatus::InProgress,
                    task.progress,
                ))
                .await?;
        }
    }

    Ok((allocated, queued))
}

/// Put `correcting` subtasks with an open correction back into `pending`
/// so the ready computation picks them up. Escalated subtasks (correcting
/// with no open correction rows) stay parked for a human.
async fn reissue_correcting(pool: &PgPool, coord: &Coordination, task_id: Uuid) -> Result<()> {
    let subtasks = subtask_db::list_for_task(pool, task_id).await?;

    for subtask in subtasks
        .iter()
        .filter(|s| s.status == SubtaskStatus::Correcting)
    {
        let open = correction_db::pending_for_subtask(pool, subtask.id).await?;
        if open.is_empty() {
            continue;
        }

        subtask_db::clear_assignment(pool, subtask.id).await?;
        let rows = subtask_db::transition_status(
            pool,
            subtask.id,
            SubtaskStatus::Correcting,
            SubtaskStatus::Pending,
        )
        .await?;
        if rows > 0 {
            tracing::info!(subtask_id = %subtask.id, "re-issuing subtask for correction");
            coord
                .set_subtask_status(subtask.id, SubtaskStatus::Pending)
                .await?;
        }
    }

    Ok(())
}

/// Event-driven half: on a completed subtask, check task completion and
/// allocate the newly ready set of that task only.
pub async fn on_subtask_complete(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    subtask_id: Uuid,
) -> Result<CompletionResult> {
    tracing::info!(subtask_id = %subtask_id, "handling subtask completion");
    let mut result = CompletionResult::default();

    let Some(subtask) = subtask_db::get_subtask(pool, subtask_id).await? else {
        tracing::warn!(subtask_id = %subtask_id, "completed subtask not found");
        return Ok(result);
    };

    result.task_completed = decomposer::check_task_completion(pool, coord, subtask.task_id).await?;
    if result.task_completed {
        tracing::info!(task_id = %subtask.task_id, "task reached a terminal state");
        return Ok(result);
    }

    // A checkpoint may have paused the task since the completion landed;
    // paused tasks get nothing new.
    if let Some(task) = task_db::get_task(pool, subtask.task_id).await? {
        if task.status == TaskStatus::Checkpoint {
            tracing::info!(task_id = %task.id, "task paused at checkpoint, skipping allocation");
            return Ok(result);
        }
    }

    for (ready, worker) in
        allocator::allocate_ready_subtasks(pool, coord, config, subtask.task_id).await?
    {
        if worker.is_some() {
            result.newly_allocated += 1;
        } else {
            tracing::debug!(subtask_id = %ready.id, "ready subtask not allocatable yet");
        }
    }

    tracing::info!(
        subtask_id = %subtask_id,
        newly_allocated = result.newly_allocated,
        "subtask completion handled"
    );

    Ok(result)
}

/// Dependency-level partition of a task's subtasks.
pub async fn dependency_levels(pool: &PgPool, task_id: Uuid) -> Result<Vec<Vec<Uuid>>> {
    let subtasks = subtask_db::list_for_task(pool, task_id).await?;
    Ok(levels::partition_levels(&subtasks))
}

/// Statistics from a parallel-coordination pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParallelStats {
    pub task_id: Uuid,
    pub levels: usize,
    pub subtasks_per_level: Vec<usize>,
    pub allocated: usize,
    pub queued: usize,
}

/// Allocate a task's subtasks level by level. Only the earliest incomplete
/// level can hold ready work; later levels unlock through the normal
/// completion hook, so this never blocks waiting for workers.
pub async fn coordinate_parallel_execution(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    task_id: Uuid,
) -> ControlResult<ParallelStats> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("task {task_id}")))?;

    let subtasks = subtask_db::list_for_task(pool, task.id).await?;
    let partition = levels::partition_levels(&subtasks);

    let mut stats = ParallelStats {
        task_id,
        levels: partition.len(),
        subtasks_per_level: partition.iter().map(|l| l.len()).collect(),
        ..ParallelStats::default()
    };

    for (ready, worker) in allocator::allocate_ready_subtasks(pool, coord, config, task_id).await? {
        if worker.is_some() {
            stats.allocated += 1;
        } else {
            tracing::debug!(subtask_id = %ready.id, "parallel pass queued subtask");
            stats.queued += 1;
        }
    }

    Ok(stats)
}

/// Scheduler statistics for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub active_tasks: i64,
    pub online_workers: usize,
    pub subtask_status_counts: std::collections::HashMap<String, i64>,
    pub queue_length: usize,
    pub in_progress_count: usize,
    pub max_concurrent_subtasks: usize,
    pub max_subtasks_per_worker: usize,
    pub scheduler_interval_seconds: u64,
}

pub async fn stats(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
) -> Result<SchedulerStats> {
    let active_tasks = task_db::count_active_tasks(pool).await?;
    let counts = subtask_db::global_status_counts(pool).await?;
    let queue_length = coord.queue_len().await?;
    let in_progress_count = coord.in_progress_count().await?;
    let online_workers = coord.online_workers().await?.len();

    Ok(SchedulerStats {
        active_tasks,
        online_workers,
        subtask_status_counts: counts.into_iter().collect(),
        queue_length,
        in_progress_count,
        max_concurrent_subtasks: config.max_concurrent_subtasks,
        max_subtasks_per_worker: config.max_subtasks_per_worker,
        scheduler_interval_seconds: config.scheduler_interval.as_secs(),
    })
}

/// In-progress count from the coordinator, falling back to the store when
/// the mirror is empty (cold start).
async fn current_in_progress(pool: &PgPool, coord: &Coordination) -> Result<usize> {
    let count = coord.in_progress_count().await?;
    if count > 0 {
        return Ok(count);
    }
    Ok(subtask_db::in_progress_count(pool).await? as usize)
}

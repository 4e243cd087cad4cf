//! Task decomposition: template selection, two-pass subtask creation, the
//! ready-set computation, and the task-completion check.

pub mod templates;

use std::collections::HashMap;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Subtask, Task, TaskStatus};
use drover_db::queries::subtasks::{self as subtask_db, NewSubtask};
use drover_db::queries::tasks as task_db;

use crate::coordination::Coordination;
use crate::coordination::events::Event;
use crate::error::{ControlError, ControlResult};

/// How much of the parent task description is folded into each subtask.
const CONTEXT_LIMIT: usize = 500;

/// Decompose a task into its template's subtask DAG.
///
/// Two passes: insert every row first, then resolve dependency names to the
/// freshly assigned sibling ids. Sets the task to `initializing` and
/// records the subtask count in its metadata. Refuses to run on a task that
/// already has subtasks.
pub async fn decompose_task(
    pool: &PgPool,
    coord: &Coordination,
    task_id: Uuid,
) -> ControlResult<Vec<Subtask>> {
    tracing::info!(task_id = %task_id, "decomposing task");

    let task = task_db::get_task(pool, task_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("task {task_id}")))?;

    let existing = subtask_db::count_for_task(pool, task_id).await?;
    if existing > 0 {
        return Err(ControlError::bad_state(format!(
            "task {task_id} already has {existing} subtasks"
        )));
    }

    let task_type = task_type_of(&task);
    let specs = templates::template_for(&task_type);

    // First pass: insert all rows with empty dependencies.
    let mut by_name: HashMap<&str, Uuid> = HashMap::new();
    let mut subtasks = Vec::with_capacity(specs.len());
    for spec in specs {
        let description = enhance_description(spec.description, &task.description);
        let subtask = subtask_db::insert_subtask(
            pool,
            &NewSubtask {
                task_id,
                name: spec.name,
                description: &description,
                subtask_type: spec.subtask_type,
                recommended_tool: spec.recommended_tool,
                complexity: spec.complexity,
                priority: spec.priority,
                dependencies: &[],
                output: None,
            },
        )
        .await?;
        by_name.insert(spec.name, subtask.id);
        subtasks.push(subtask);
    }

    // Second pass: resolve dependency names to sibling ids.
    for (spec, subtask) in specs.iter().zip(subtasks.iter_mut()) {
        if spec.dependency_names.is_empty() {
            continue;
        }
        let deps: Vec<Uuid> = spec
            .dependency_names
            .iter()
            .filter_map(|name| by_name.get(name).copied())
            .collect();
        subtask_db::set_dependencies(pool, subtask.id, &deps).await?;
        subtask.dependencies = deps;
    }

    task_db::update_task_status(pool, task_id, TaskStatus::Initializing).await?;
    task_db::merge_task_metadata(
        pool,
        task_id,
        &serde_json::json!({"estimated_subtasks": subtasks.len()}),
    )
    .await?;

    coord
        .set_task_status(task_id, TaskStatus::Initializing)
        .await
        .map_err(ControlError::Internal)?;

    tracing::info!(
        task_id = %task_id,
        task_type = %task_type,
        subtask_count = subtasks.len(),
        "task decomposed"
    );

    Ok(subtasks)
}

fn task_type_of(task: &Task) -> String {
    task.metadata
        .get("task_type")
        .and_then(|v| v.as_str())
        .unwrap_or(templates::DEFAULT_TASK_TYPE)
        .to_owned()
}

/// Prepend the template description with (truncated) parent-task context.
fn enhance_description(base: &str, task_description: &str) -> String {
    let context: String = task_description.chars().take(CONTEXT_LIMIT).collect();
    format!("{base}\n\nTask Context:\n{context}")
}

/// Ready subtasks of a task: pending with every dependency completed.
pub async fn ready_subtasks(pool: &PgPool, task_id: Uuid) -> Result<Vec<Subtask>> {
    subtask_db::ready_for_task(pool, task_id).await
}

/// Recompute a task's progress and apply terminal transitions.
///
/// Any failed subtask fails the task; all-completed completes it. Returns
/// whether the task reached a terminal state. Publishes a task update
/// either way so observers see fresh progress.
pub async fn check_task_completion(
    pool: &PgPool,
    coord: &Coordination,
    task_id: Uuid,
) -> Result<bool> {
    let counts = subtask_db::status_counts(pool, task_id).await?;
    if counts.total == 0 {
        // An empty DAG never auto-completes.
        return Ok(false);
    }

    let progress = counts.progress();

    let (new_status, terminal) = if counts.failed > 0 {
        (TaskStatus::Failed, true)
    } else if counts.completed == counts.total {
        (TaskStatus::Completed, true)
    } else {
        // Non-terminal: keep whatever status the task currently holds
        // (it may be paused at a checkpoint).
        let current = task_db::get_task(pool, task_id)
            .await?
            .map(|t| t.status)
            .unwrap_or(TaskStatus::InProgress);
        (current, false)
    };

    if terminal {
        let rows = task_db::finish_task(pool, task_id, new_status, progress).await?;
        if rows == 0 {
            // Already terminal; nothing to announce.
            return Ok(true);
        }
        tracing::info!(task_id = %task_id, status = %new_status, "task reached terminal status");
        coord.set_task_status(task_id, new_status).await?;
        coord.set_task_progress(task_id, progress).await?;
        coord
            .publish_event(&Event::task_update(task_id, new_status, progress))
            .await?;
        return Ok(true);
    }

    task_db::set_task_progress(pool, task_id, progress).await?;
    coord.set_task_progress(task_id, progress).await?;
    coord
        .publish_event(&Event::task_update(task_id, new_status, progress))
        .await?;

    Ok(false)
}

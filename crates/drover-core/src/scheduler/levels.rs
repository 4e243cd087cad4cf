//! Dependency-level partition of a task's subtask DAG.
//!
//! Level 0 holds subtasks with no dependencies; level n holds subtasks
//! whose dependencies all live in earlier levels. Subtasks within a level
//! can run in parallel.

use std::collections::HashSet;

use uuid::Uuid;

use drover_db::models::Subtask;

/// Partition subtasks into dependency levels.
///
/// Stops early when no remaining subtask can be placed (a dependency cycle
/// or a dangling dependency id); the leftovers are simply not part of any
/// level, which the caller can detect by comparing counts.
pub fn partition_levels(subtasks: &[Subtask]) -> Vec<Vec<Uuid>> {
    let mut levels: Vec<Vec<Uuid>> = Vec::new();
    let mut placed: HashSet<Uuid> = HashSet::new();

    while placed.len() < subtasks.len() {
        let current: Vec<Uuid> = subtasks
            .iter()
            .filter(|s| !placed.contains(&s.id))
            .filter(|s| s.dependencies.iter().all(|d| placed.contains(d)))
            .map(|s| s.id)
            .collect();

        if current.is_empty() {
            tracing::warn!(
                unplaced = subtasks.len() - placed.len(),
                "could not assign all subtasks to dependency levels"
            );
            break;
        }

        placed.extend(current.iter().copied());
        levels.push(current);
    }

    levels
}

//! Scheduler tests: the full happy-path lifecycle, concurrency caps,
//! fairness, cycle locking, and the dependency-level helper.

mod common;

use common::{by_name, TestEnv};
use drover_core::{decomposer, scheduler};
use drover_db::models::{SubtaskStatus, SubtaskType, TaskStatus};
use drover_db::queries::subtasks::{self as subtask_db, NewSubtask};
use uuid::Uuid;

/// The four-step feature flow end to end: decompose, allocate in DAG
/// order across two workers, upload results, finish at 100%.
#[tokio::test]
async fn happy_path_four_step_feature() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();

    let cg = by_name(&subtasks, "Code Generation").clone();
    let cr = by_name(&subtasks, "Code Review").clone();
    let tg = by_name(&subtasks, "Test Generation").clone();
    let doc = by_name(&subtasks, "Documentation").clone();

    let w1 = env.online_worker("fleet-a", &["claude_code"], 20.0, 30.0, 10.0).await;
    let w2 = env.online_worker("fleet-b", &["claude_code"], 20.0, 30.0, 10.0).await;
    let lower_id = std::cmp::min(w1.id, w2.id);

    // Cycle 1: only Code Generation is ready; ties break toward the lower
    // worker id; the task moves to in_progress with started_at stamped.
    let result = scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert_eq!(result.subtasks_allocated, 1);
    assert!(result.errors.is_empty());

    let cg_now = env.refreshed(cg.id).await;
    assert_eq!(cg_now.status, SubtaskStatus::Queued);
    assert_eq!(cg_now.assigned_worker, Some(lower_id));

    let task_now = env.task(task.id).await;
    assert_eq!(task_now.status, TaskStatus::InProgress);
    assert!(task_now.started_at.is_some());

    // Code Generation completes; Code Review and Test Generation become
    // ready together and allocate in parallel onto the two workers.
    let outcome = env
        .upload_success(cg.id, serde_json::json!({"files": ["lib.rs"]}))
        .await;
    assert_eq!(outcome.newly_allocated, 2);
    assert!(!outcome.task_completed);
    assert_eq!(env.task(task.id).await.progress, 25);

    let cr_now = env.refreshed(cr.id).await;
    let tg_now = env.refreshed(tg.id).await;
    assert_eq!(cr_now.status, SubtaskStatus::Queued);
    assert_eq!(tg_now.status, SubtaskStatus::Queued);
    assert!(cr_now.assigned_worker.is_some());
    assert!(tg_now.assigned_worker.is_some());
    assert_ne!(cr_now.assigned_worker, tg_now.assigned_worker);

    // Review passes threshold (no fix spawned), tests finish, then the
    // documentation step unlocks.
    env.upload_success(cr.id, serde_json::json!({"score": 9.0, "issues": [], "summary": "ok"}))
        .await;
    assert_eq!(env.task(task.id).await.progress, 50);

    let outcome = env.upload_success(tg.id, serde_json::json!({"tests": 12})).await;
    assert_eq!(outcome.newly_allocated, 1);
    assert_eq!(env.refreshed(doc.id).await.status, SubtaskStatus::Queued);

    let outcome = env.upload_success(doc.id, serde_json::json!({"readme": true})).await;
    assert!(outcome.task_completed);

    let final_task = env.task(task.id).await;
    assert_eq!(final_task.status, TaskStatus::Completed);
    assert_eq!(final_task.progress, 100);
    assert!(final_task.completed_at.is_some());

    // No review chain grew: the template's own review covered it.
    assert_eq!(env.subtasks_of(task.id).await.len(), 4);

    // Shared state drained.
    assert_eq!(env.coord.in_progress_count().await.unwrap(), 0);
    assert_eq!(env.coord.queue_len().await.unwrap(), 0);

    env.teardown().await;
}

#[tokio::test]
async fn concurrency_cap_queues_overflow() {
    let mut env = TestEnv::new().await;
    env.config.max_concurrent_subtasks = 1;

    let t1 = env.create_task("develop_feature").await;
    let t2 = env.create_task("develop_feature").await;
    decomposer::decompose_task(&env.pool, &env.coord, t1.id).await.unwrap();
    decomposer::decompose_task(&env.pool, &env.coord, t2.id).await.unwrap();

    env.online_worker("cap-a", &["claude_code"], 10.0, 10.0, 10.0).await;
    env.online_worker("cap-b", &["claude_code"], 10.0, 10.0, 10.0).await;

    let result = scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert_eq!(result.subtasks_allocated, 1);
    assert!(result.subtasks_queued >= 1);
    assert!(env.coord.in_progress_count().await.unwrap() <= 1);

    env.teardown().await;
}

#[tokio::test]
async fn cycle_short_circuits_at_capacity() {
    let mut env = TestEnv::new().await;
    env.config.max_concurrent_subtasks = 1;

    let task = env.create_task("develop_feature").await;
    decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    env.online_worker("busy-bee", &["claude_code"], 10.0, 10.0, 10.0).await;

    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();

    // The system is saturated; the next cycle reports it and does nothing.
    let result = scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert_eq!(result.subtasks_allocated, 0);
    assert_eq!(result.message.as_deref(), Some("system at max capacity"));

    env.teardown().await;
}

#[tokio::test]
async fn equal_priority_subtasks_all_allocate_with_enough_workers() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;

    // Hand-build two equal-priority, dependency-free subtasks.
    for name in ["left", "right"] {
        subtask_db::insert_subtask(
            &env.pool,
            &NewSubtask {
                task_id: task.id,
                name,
                description: "parallel leg",
                subtask_type: SubtaskType::CodeGeneration,
                recommended_tool: Some("claude_code"),
                complexity: 2,
                priority: 70,
                dependencies: &[],
                output: None,
            },
        )
        .await
        .unwrap();
    }
    drover_db::queries::tasks::update_task_status(&env.pool, task.id, TaskStatus::Initializing)
        .await
        .unwrap();

    env.online_worker("pair-a", &["claude_code"], 20.0, 20.0, 20.0).await;
    env.online_worker("pair-b", &["claude_code"], 20.0, 20.0, 20.0).await;

    let result = scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert_eq!(result.subtasks_allocated, 2);

    let subtasks = env.subtasks_of(task.id).await;
    let workers: Vec<Option<Uuid>> = subtasks.iter().map(|s| s.assigned_worker).collect();
    assert!(workers.iter().all(|w| w.is_some()));
    assert_ne!(workers[0], workers[1]);

    env.teardown().await;
}

#[tokio::test]
async fn cycle_lock_skips_concurrent_runner() {
    let env = TestEnv::new().await;

    // Hold the scheduler lock as if another process were mid-cycle.
    assert!(env
        .coord
        .acquire_lock("scheduler", "other-process", std::time::Duration::from_secs(30))
        .await
        .unwrap());

    let result = scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert_eq!(result.tasks_processed, 0);
    assert!(result
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("lock"));

    env.coord.release_lock("scheduler").await.unwrap();

    // With the lock free the cycle runs (and releases the lock again).
    let result = scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert!(result.message.is_none());
    let result = scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert!(result.message.is_none());

    env.teardown().await;
}

#[tokio::test]
async fn schedule_task_decomposes_pending_tasks() {
    let env = TestEnv::new().await;
    let task = env.create_task("bug_fix").await;
    env.online_worker("solo", &["claude_code"], 10.0, 10.0, 10.0).await;

    let result = scheduler::schedule_task(&env.pool, &env.coord, &env.config, task.id)
        .await
        .unwrap();
    assert_eq!(result.subtasks_allocated, 1);

    let subtasks = env.subtasks_of(task.id).await;
    assert_eq!(subtasks.len(), 3);
    assert_eq!(by_name(&subtasks, "Bug Analysis").status, SubtaskStatus::Queued);

    env.teardown().await;
}

#[tokio::test]
async fn dependency_levels_match_template_shape() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();

    let levels = scheduler::dependency_levels(&env.pool, task.id).await.unwrap();
    assert_eq!(levels.len(), 3);
    assert_eq!(levels[0], vec![by_name(&subtasks, "Code Generation").id]);
    assert_eq!(levels[1].len(), 2);
    assert_eq!(levels[2], vec![by_name(&subtasks, "Documentation").id]);

    env.teardown().await;
}

#[tokio::test]
async fn failed_upload_fails_the_task_and_frees_the_worker() {
    let env = TestEnv::new().await;
    let task = env.create_task("bug_fix").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    let analysis = by_name(&subtasks, "Bug Analysis").clone();

    let worker = env.online_worker("crash-1", &["claude_code"], 10.0, 10.0, 10.0).await;
    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();

    let outcome = env.upload_failure(analysis.id, "tool crashed with exit 137").await;
    assert!(outcome.task_completed);

    let task_now = env.task(task.id).await;
    assert_eq!(task_now.status, TaskStatus::Failed);
    assert!(task_now.completed_at.is_some());

    let sub = env.refreshed(analysis.id).await;
    assert_eq!(sub.status, drover_db::models::SubtaskStatus::Failed);
    assert_eq!(sub.error.as_deref(), Some("tool crashed with exit 137"));
    assert_eq!(sub.progress, 0);

    // The worker slot is free again for other tasks.
    assert!(env.coord.worker_current_task(worker.id).await.unwrap().is_none());
    assert_eq!(env.coord.in_progress_count().await.unwrap(), 0);

    env.teardown().await;
}

#[tokio::test]
async fn completion_hook_is_safe_for_unknown_subtask() {
    let env = TestEnv::new().await;
    let result =
        scheduler::on_subtask_complete(&env.pool, &env.coord, &env.config, Uuid::new_v4())
            .await
            .unwrap();
    assert_eq!(result.newly_allocated, 0);
    assert!(!result.task_completed);

    env.teardown().await;
}

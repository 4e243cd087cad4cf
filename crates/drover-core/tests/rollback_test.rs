//! Rollback tests: resetting post-snapshot work, clearing evaluations,
//! discarding later checkpoints, and recomputing progress.

mod common;

use common::{by_name, TestEnv};
use drover_core::checkpoint::{self, DecisionRequest};
use drover_core::{decomposer, scheduler};
use drover_db::models::{SubtaskStatus, TaskStatus, TriggerReason, UserDecision};
use drover_db::queries::checkpoints as checkpoint_db;
use drover_db::queries::evaluations::{self, insert_evaluation, NewEvaluation};

async fn accept(env: &TestEnv, checkpoint_id: uuid::Uuid) {
    checkpoint::process_decision(
        &env.pool,
        &env.coord,
        checkpoint_id,
        DecisionRequest {
            decision: UserDecision::Accept,
            feedback: None,
            correction_type: None,
            reference_files: Vec::new(),
            apply_to_future: false,
        },
    )
    .await
    .expect("decision should apply");
}

async fn score(env: &TestEnv, subtask_id: uuid::Uuid, value: f64) {
    insert_evaluation(
        &env.pool,
        &NewEvaluation {
            subtask_id,
            code_quality: None,
            completeness: None,
            security: None,
            architecture: None,
            testability: None,
            overall_score: value,
            details: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn rollback_resets_post_snapshot_subtasks() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    let cg = by_name(&subtasks, "Code Generation").clone();
    let cr = by_name(&subtasks, "Code Review").clone();
    let tg = by_name(&subtasks, "Test Generation").clone();

    env.online_worker("roll-a", &["claude_code"], 20.0, 30.0, 10.0).await;
    env.online_worker("roll-b", &["claude_code"], 20.0, 30.0, 10.0).await;

    // Complete Code Generation, then pin a checkpoint whose snapshot is
    // exactly {CG}.
    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    env.upload_success(cg.id, serde_json::json!({"files": ["lib.rs"]})).await;

    let anchor = checkpoint::create_checkpoint(
        &env.pool,
        &env.coord,
        task.id,
        TriggerReason::Manual,
        serde_json::json!({}),
    )
    .await
    .unwrap();
    assert_eq!(anchor.subtasks_completed, vec![cg.id]);
    accept(&env, anchor.id).await;

    // Review and tests complete after the snapshot, with evaluations.
    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    env.upload_success(cr.id, serde_json::json!({"score": 8.0})).await;
    env.upload_success(tg.id, serde_json::json!({"tests": 9})).await;
    score(&env, cr.id, 8.0).await;
    score(&env, tg.id, 7.5).await;
    assert_eq!(env.task(task.id).await.progress, 75);

    // A later checkpoint that the rollback must discard.
    let later = checkpoint::create_checkpoint(
        &env.pool,
        &env.coord,
        task.id,
        TriggerReason::Manual,
        serde_json::json!({}),
    )
    .await
    .unwrap();
    accept(&env, later.id).await;

    // Preview first: two resets, two evaluations, one later checkpoint.
    let preview = checkpoint::rollback_preview(&env.pool, anchor.id).await.unwrap();
    assert_eq!(preview.subtasks_to_reset.len(), 2);
    assert_eq!(preview.evaluations_to_clear, 2);
    assert_eq!(preview.checkpoints_to_delete, 1);
    assert_eq!(preview.new_progress_after_rollback, 25);
    assert!(preview.can_rollback);

    // Roll back.
    let outcome = checkpoint::rollback_to_checkpoint(
        &env.pool,
        &env.coord,
        anchor.id,
        Some("review direction changed"),
        true,
    )
    .await
    .unwrap();
    assert_eq!(outcome.subtasks_reset, 2);
    assert_eq!(outcome.evaluations_cleared, 2);
    assert_eq!(outcome.checkpoints_deleted, 1);
    assert_eq!(outcome.task_progress, 25);

    // The reset subtasks are clean pending rows again.
    for id in [cr.id, tg.id] {
        let sub = env.refreshed(id).await;
        assert_eq!(sub.status, SubtaskStatus::Pending);
        assert_eq!(sub.progress, 0);
        assert!(sub.output.is_none());
        assert!(sub.assigned_worker.is_none());
        assert!(sub.completed_at.is_none());
        assert!(
            evaluations::list_for_subtask(&env.pool, id).await.unwrap().is_empty(),
            "evaluations should be cleared"
        );
    }

    // The snapshot member is untouched.
    assert_eq!(env.refreshed(cg.id).await.status, SubtaskStatus::Completed);

    // Task state restored: in progress at snapshot-derived progress.
    let task_now = env.task(task.id).await;
    assert_eq!(task_now.status, TaskStatus::InProgress);
    assert_eq!(task_now.progress, 25);
    assert!(task_now.completed_at.is_none());

    // Only the anchor checkpoint survives, annotated with the rollback.
    let remaining = checkpoint_db::list_for_task(&env.pool, task.id).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, anchor.id);
    assert!(
        remaining[0]
            .decision_notes
            .as_deref()
            .unwrap_or_default()
            .contains("[rollback]")
    );

    env.teardown().await;
}

#[tokio::test]
async fn rollback_refuses_terminal_tasks() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    let cg = by_name(&subtasks, "Code Generation").clone();

    drover_db::queries::subtasks::set_status(&env.pool, cg.id, SubtaskStatus::Completed)
        .await
        .unwrap();
    drover_db::queries::tasks::update_task_status(&env.pool, task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    let checkpoint = checkpoint::create_checkpoint(
        &env.pool,
        &env.coord,
        task.id,
        TriggerReason::Manual,
        serde_json::json!({}),
    )
    .await
    .unwrap();

    drover_db::queries::tasks::cancel_task(&env.pool, task.id).await.unwrap();

    let err =
        checkpoint::rollback_to_checkpoint(&env.pool, &env.coord, checkpoint.id, None, true)
            .await
            .expect_err("terminal task cannot roll back");
    assert!(err.to_string().contains("cannot roll back"));

    env.teardown().await;
}

#[tokio::test]
async fn rollback_restores_snapshot_progress_invariant() {
    let env = TestEnv::new().await;
    let task = env.create_task("testing").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();

    // Complete the first two of four subtasks, snapshot, complete a third.
    drover_db::queries::subtasks::set_status(&env.pool, subtasks[0].id, SubtaskStatus::Completed)
        .await
        .unwrap();
    drover_db::queries::subtasks::set_status(&env.pool, subtasks[1].id, SubtaskStatus::Completed)
        .await
        .unwrap();
    drover_db::queries::tasks::update_task_status(&env.pool, task.id, TaskStatus::InProgress)
        .await
        .unwrap();

    let checkpoint = checkpoint::create_checkpoint(
        &env.pool,
        &env.coord,
        task.id,
        TriggerReason::Manual,
        serde_json::json!({}),
    )
    .await
    .unwrap();
    assert_eq!(checkpoint.subtasks_completed.len(), 2);
    accept(&env, checkpoint.id).await;

    drover_db::queries::subtasks::set_status(&env.pool, subtasks[2].id, SubtaskStatus::Completed)
        .await
        .unwrap();

    let outcome =
        checkpoint::rollback_to_checkpoint(&env.pool, &env.coord, checkpoint.id, None, true)
            .await
            .unwrap();

    // progress = floor(100 * |snapshot| / total) = floor(200/4)
    assert_eq!(outcome.task_progress, 50);
    assert_eq!(env.task(task.id).await.progress, 50);

    env.teardown().await;
}

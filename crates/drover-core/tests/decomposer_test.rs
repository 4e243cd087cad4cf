//! Decomposition tests: template materialisation, dependency resolution,
//! and the completion/progress bookkeeping.

mod common;

use common::{by_name, TestEnv};
use drover_core::decomposer;
use drover_db::models::{SubtaskStatus, SubtaskType, TaskStatus};
use drover_db::queries::subtasks as subtask_db;
use drover_db::queries::tasks as task_db;

#[tokio::test]
async fn develop_feature_template_builds_expected_dag() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;

    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id)
        .await
        .expect("decompose should succeed");

    assert_eq!(subtasks.len(), 4);
    let names: Vec<&str> = subtasks.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Code Generation",
            "Code Review",
            "Test Generation",
            "Documentation"
        ]
    );

    let cg = by_name(&subtasks, "Code Generation");
    let cr = by_name(&subtasks, "Code Review");
    let tg = by_name(&subtasks, "Test Generation");
    let doc = by_name(&subtasks, "Documentation");

    assert!(cg.dependencies.is_empty());
    assert_eq!(cr.dependencies, vec![cg.id]);
    assert_eq!(tg.dependencies, vec![cg.id]);
    let mut doc_deps = doc.dependencies.clone();
    doc_deps.sort();
    let mut expected = vec![cr.id, tg.id];
    expected.sort();
    assert_eq!(doc_deps, expected);

    assert_eq!(cg.subtask_type, SubtaskType::CodeGeneration);
    assert_eq!(cr.subtask_type, SubtaskType::CodeReview);

    // Task moved to initializing with the subtask count recorded.
    let task = env.task(task.id).await;
    assert_eq!(task.status, TaskStatus::Initializing);
    assert_eq!(task.metadata["estimated_subtasks"], 4);

    // Subtask descriptions carry parent context.
    assert!(cg.description.contains("Task Context:"));
    assert!(cg.description.contains("fleet dashboard"));

    env.teardown().await;
}

#[tokio::test]
async fn unknown_task_type_uses_default_template() {
    let env = TestEnv::new().await;
    let task = env.create_task("underwater_basket_weaving").await;

    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id)
        .await
        .expect("decompose should succeed");
    assert_eq!(subtasks.len(), 4);
    assert_eq!(subtasks[0].name, "Code Generation");

    env.teardown().await;
}

#[tokio::test]
async fn decompose_refuses_second_run() {
    let env = TestEnv::new().await;
    let task = env.create_task("bug_fix").await;

    decomposer::decompose_task(&env.pool, &env.coord, task.id)
        .await
        .expect("first decompose should succeed");

    let err = decomposer::decompose_task(&env.pool, &env.coord, task.id)
        .await
        .expect_err("second decompose must be rejected");
    assert!(err.to_string().contains("already has"));

    env.teardown().await;
}

#[tokio::test]
async fn empty_dag_never_auto_completes() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;

    // A task pushed to initializing without any subtasks just sits there.
    task_db::update_task_status(&env.pool, task.id, TaskStatus::Initializing)
        .await
        .unwrap();

    let terminal = decomposer::check_task_completion(&env.pool, &env.coord, task.id)
        .await
        .expect("completion check should succeed");
    assert!(!terminal);
    assert_eq!(env.task(task.id).await.status, TaskStatus::Initializing);

    env.teardown().await;
}

#[tokio::test]
async fn any_failed_subtask_fails_the_task() {
    let env = TestEnv::new().await;
    let task = env.create_task("bug_fix").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id)
        .await
        .unwrap();

    subtask_db::set_status(&env.pool, subtasks[0].id, SubtaskStatus::Completed)
        .await
        .unwrap();
    subtask_db::set_status(&env.pool, subtasks[1].id, SubtaskStatus::Failed)
        .await
        .unwrap();

    let terminal = decomposer::check_task_completion(&env.pool, &env.coord, task.id)
        .await
        .unwrap();
    assert!(terminal);

    let task = env.task(task.id).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.completed_at.is_some());
    // floor(100 * 1 / 3)
    assert_eq!(task.progress, 33);

    env.teardown().await;
}

#[tokio::test]
async fn progress_tracks_completed_fraction() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id)
        .await
        .unwrap();

    let cg = by_name(&subtasks, "Code Generation");
    subtask_db::set_status(&env.pool, cg.id, SubtaskStatus::Completed)
        .await
        .unwrap();

    let terminal = decomposer::check_task_completion(&env.pool, &env.coord, task.id)
        .await
        .unwrap();
    assert!(!terminal);
    assert_eq!(env.task(task.id).await.progress, 25);

    // All four done -> completed at 100.
    for subtask in &subtasks {
        subtask_db::set_status(&env.pool, subtask.id, SubtaskStatus::Completed)
            .await
            .unwrap();
    }
    let terminal = decomposer::check_task_completion(&env.pool, &env.coord, task.id)
        .await
        .unwrap();
    assert!(terminal);

    let task = env.task(task.id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);

    env.teardown().await;
}

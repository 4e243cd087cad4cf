//! Review chain tests: review spawning, fix cycles, re-review tracking,
//! and escalation once the cycle budget is spent.

mod common;

use common::{by_name, TestEnv};
use drover_core::{decomposer, review, scheduler};
use drover_db::models::{SubtaskStatus, SubtaskType};

/// The full escalation path with `max_fix_cycles = 2`:
/// CG -> CR1 (score 4) -> FIX1 -> CR2 (score 5) -> escalate, flagging the
/// original subtask for a human.
#[tokio::test]
async fn failing_reviews_escalate_after_max_cycles() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    let cg = by_name(&subtasks, "Code Generation").clone();
    let cr1 = by_name(&subtasks, "Code Review").clone();
    let tg = by_name(&subtasks, "Test Generation").clone();

    env.online_worker("chain-a", &["claude_code"], 20.0, 30.0, 10.0).await;
    env.online_worker("chain-b", &["claude_code"], 20.0, 30.0, 10.0).await;

    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    env.upload_success(cg.id, serde_json::json!({"files": ["lib.rs"]})).await;
    env.upload_success(tg.id, serde_json::json!({"tests": 4})).await;

    // CR1 reports a failing score: a fix subtask appears, depending on the
    // review, at a bumped priority, preferring the original tooling.
    env.upload_success(
        cr1.id,
        serde_json::json!({
            "score": 4.0,
            "issues": [
                {"dimension": "logic", "severity": "high", "description": "off-by-one in pager"}
            ],
            "suggestions": [],
            "summary": "needs rework",
        }),
    )
    .await;

    let all = env.subtasks_of(task.id).await;
    let fix1 = all
        .iter()
        .find(|s| s.subtask_type == SubtaskType::CodeFix)
        .expect("fix subtask should exist")
        .clone();
    assert_eq!(fix1.dependencies, vec![cr1.id]);
    assert_eq!(fix1.priority, cr1.priority + 5);
    assert_eq!(fix1.recommended_tool.as_deref(), Some("claude_code"));
    assert!(fix1.name.contains("Cycle 1"));

    // The fix allocates (its review dependency is complete) and finishes;
    // a second review round is spawned for the fixed output.
    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    assert_eq!(env.refreshed(fix1.id).await.status, SubtaskStatus::Queued);
    env.upload_success(fix1.id, serde_json::json!({"files": ["lib.rs"], "fixed": true}))
        .await;

    let all = env.subtasks_of(task.id).await;
    let cr2 = all
        .iter()
        .filter(|s| s.subtask_type == SubtaskType::CodeReview)
        .find(|s| s.name.contains("Cycle 2"))
        .expect("re-review should exist")
        .clone();
    assert_eq!(cr2.dependencies, vec![fix1.id]);

    // CR2 still fails. A third round would exceed max_fix_cycles = 2, so
    // the chain escalates: the original subtask is parked in `correcting`
    // with a human-review flag, and no second fix appears.
    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    env.upload_success(
        cr2.id,
        serde_json::json!({"score": 5.0, "issues": [], "summary": "still short"}),
    )
    .await;

    let cg_now = env.refreshed(cg.id).await;
    assert_eq!(cg_now.status, SubtaskStatus::Correcting);
    let escalation = &cg_now.output.expect("output should exist")["escalation"];
    assert_eq!(escalation["requires_human_review"], true);

    let fixes = env
        .subtasks_of(task.id)
        .await
        .into_iter()
        .filter(|s| s.subtask_type == SubtaskType::CodeFix)
        .count();
    assert_eq!(fixes, 1, "no fix beyond the cycle budget");

    // The chain listing reports the spawned members in cycle order.
    let chain = review::review_chain(&env.pool, cg.id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].subtask_type, SubtaskType::CodeFix);
    assert_eq!(chain[0].review_cycle, 1);
    assert_eq!(chain[1].subtask_type, SubtaskType::CodeReview);
    assert_eq!(chain[1].review_cycle, 2);
    assert_eq!(chain[1].score, Some(5.0));

    env.teardown().await;
}

/// A passing review ends the chain immediately.
#[tokio::test]
async fn passing_review_spawns_nothing() {
    let env = TestEnv::new().await;
    let task = env.create_task("develop_feature").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    let cg = by_name(&subtasks, "Code Generation").clone();
    let cr = by_name(&subtasks, "Code Review").clone();

    env.online_worker("calm-a", &["claude_code"], 20.0, 30.0, 10.0).await;
    env.online_worker("calm-b", &["claude_code"], 20.0, 30.0, 10.0).await;

    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    env.upload_success(cg.id, serde_json::json!({"files": ["lib.rs"]})).await;
    env.upload_success(cr.id, serde_json::json!({"score": 8.5, "summary": "ship it"}))
        .await;

    let all = env.subtasks_of(task.id).await;
    assert_eq!(all.len(), 4, "no chain members spawned");
    assert!(all.iter().all(|s| s.subtask_type != SubtaskType::CodeFix));

    // The parsed report was persisted onto the review subtask.
    let cr_now = env.refreshed(cr.id).await;
    let report = &cr_now.output.unwrap()["review_result"];
    assert_eq!(report["score"], 8.5);

    env.teardown().await;
}

/// Code-generation subtasks with no review in their DAG get one spawned
/// automatically on completion.
#[tokio::test]
async fn standalone_generation_gets_auto_review() {
    let env = TestEnv::new().await;
    let task = env.create_task("bug_fix").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    // bug_fix: Bug Analysis -> Fix Implementation (code_generation) ->
    // Regression Testing; no code_review anywhere.
    let analysis = by_name(&subtasks, "Bug Analysis").clone();
    let fiximpl = by_name(&subtasks, "Fix Implementation").clone();

    env.online_worker("auto-a", &["claude_code"], 20.0, 30.0, 10.0).await;
    env.online_worker("auto-b", &["claude_code"], 20.0, 30.0, 10.0).await;

    scheduler::run_cycle(&env.pool, &env.coord, &env.config).await.unwrap();
    env.upload_success(analysis.id, serde_json::json!({"root_cause": "stale cache"}))
        .await;
    env.upload_success(fiximpl.id, serde_json::json!({"files": ["cache.rs"]})).await;

    let all = env.subtasks_of(task.id).await;
    let auto_review = all
        .iter()
        .find(|s| s.subtask_type == SubtaskType::CodeReview)
        .expect("auto-spawned review should exist");
    assert_eq!(auto_review.dependencies, vec![fiximpl.id]);
    assert_eq!(auto_review.priority, fiximpl.priority + 10);
    assert!(auto_review.name.starts_with("Code Review:"));

    env.teardown().await;
}

/// Review creation is idempotent per (reviewed subtask, cycle).
#[tokio::test]
async fn duplicate_review_creation_returns_existing() {
    let env = TestEnv::new().await;
    let task = env.create_task("bug_fix").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    let analysis = by_name(&subtasks, "Bug Analysis").clone();

    drover_db::queries::subtasks::set_status(&env.pool, analysis.id, SubtaskStatus::Completed)
        .await
        .unwrap();
    sqlx::query("UPDATE subtasks SET output = '{\"x\": 1}'::jsonb WHERE id = $1")
        .bind(analysis.id)
        .execute(&env.pool)
        .await
        .unwrap();

    let first = review::create_review_subtask(&env.pool, analysis.id, 1).await.unwrap();
    let second = review::create_review_subtask(&env.pool, analysis.id, 1).await.unwrap();
    assert_eq!(first.id, second.id);

    env.teardown().await;
}

/// Reviews demand a completed subtask with output.
#[tokio::test]
async fn review_requires_completed_output() {
    let env = TestEnv::new().await;
    let task = env.create_task("bug_fix").await;
    let subtasks = decomposer::decompose_task(&env.pool, &env.coord, task.id).await.unwrap();
    let analysis = by_name(&subtasks, "Bug Analysis").clone();

    // Still pending: refuse.
    let err = review::create_review_subtask(&env.pool, analysis.id, 1)
        .await
        .expect_err("pending subtask cannot be reviewed");
    assert!(err.to_string().contains("bad state"));

    // Completed but with no output: refuse.
    drover_db::queries::subtasks::set_status(&env.pool, analysis.id, SubtaskStatus::Completed)
        .await
        .unwrap();
    let err = review::create_review_subtask(&env.pool, analysis.id, 1)
        .await
        .expect_err("output-less subtask cannot be reviewed");
    assert!(err.to_string().contains("no output"));

    env.teardown().await;
}

//! Agent-pair review/fix cycles.
//!
//! A completed code-generation subtask spawns a code-review subtask that
//! depends on it. A review scoring below the threshold spawns a code-fix
//! subtask; a completed fix spawns a fresh review. Past `max_fix_cycles`
//! the chain escalates to a human instead of looping forever.

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Subtask, SubtaskStatus, SubtaskType};
use drover_db::queries::subtasks::{self as subtask_db, NewSubtask};

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult};

/// Dimensions every review is asked to cover.
pub const REVIEW_DIMENSIONS: &[&str] = &["syntax", "style", "logic", "security", "readability"];

/// Priority bumps: reviews preempt fresh work, fixes preempt reviews.
const REVIEW_PRIORITY_BUMP: i32 = 10;
const FIX_PRIORITY_BUMP: i32 = 5;

/// Parsed review output.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub score: f64,
    pub issues: Vec<serde_json::Value>,
    pub suggestions: Vec<serde_json::Value>,
    pub summary: String,
}

/// Parse the structured review a worker uploads:
/// `{score, issues[], suggestions[], summary}`. The score is mandatory and
/// must be within [0, 10].
pub fn parse_review_output(output: &serde_json::Value) -> ControlResult<ReviewReport> {
    let score = output
        .get("score")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| ControlError::invalid("review output missing numeric 'score' field"))?;

    if !(0.0..=10.0).contains(&score) {
        return Err(ControlError::invalid(format!(
            "review score {score} out of range [0-10]"
        )));
    }

    let as_array = |key: &str| {
        output
            .get(key)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    };

    Ok(ReviewReport {
        score,
        issues: as_array("issues"),
        suggestions: as_array("suggestions"),
        summary: output
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned(),
    })
}

/// Create a review subtask for a completed subtask's output.
///
/// Idempotent per (reviewed subtask, cycle): an existing review for the
/// pair is returned instead of duplicated.
pub async fn create_review_subtask(
    pool: &PgPool,
    reviewed_subtask_id: Uuid,
    review_cycle: u32,
) -> ControlResult<Subtask> {
    tracing::info!(
        reviewed_subtask_id = %reviewed_subtask_id,
        review_cycle,
        "creating review subtask"
    );

    let reviewed = subtask_db::get_subtask(pool, reviewed_subtask_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("subtask {reviewed_subtask_id}")))?;

    if reviewed.status != SubtaskStatus::Completed {
        return Err(ControlError::bad_state(format!(
            "cannot review subtask {reviewed_subtask_id} with status {}",
            reviewed.status
        )));
    }
    let Some(reviewed_output) = reviewed.output.clone() else {
        return Err(ControlError::bad_state(format!(
            "subtask {reviewed_subtask_id} has no output to review"
        )));
    };

    if let Some(existing) = find_review(pool, &reviewed, review_cycle).await? {
        tracing::warn!(
            reviewed_subtask_id = %reviewed_subtask_id,
            review_subtask_id = %existing.id,
            "review subtask already exists"
        );
        return Ok(existing);
    }

    let review_input = serde_json::json!({
        "review_input": {
            "original_subtask_id": reviewed.id,
            "original_subtask_name": reviewed.name,
            "original_description": reviewed.description,
            "code_output": reviewed_output,
            "review_cycle": review_cycle,
            "review_dimensions": REVIEW_DIMENSIONS,
        },
        "metadata": {
            "original_subtask_id": reviewed.id,
            "review_cycle": review_cycle,
        },
    });

    let name = format!("Code Review: {} (Cycle {review_cycle})", reviewed.name);
    let description = review_description(&reviewed, review_cycle);

    let review = subtask_db::insert_subtask(
        pool,
        &NewSubtask {
            task_id: reviewed.task_id,
            name: &name,
            description: &description,
            subtask_type: SubtaskType::CodeReview,
            recommended_tool: None,
            complexity: 2,
            priority: reviewed.priority + REVIEW_PRIORITY_BUMP,
            dependencies: &[reviewed.id],
            output: Some(review_input),
        },
    )
    .await?;

    tracing::info!(
        review_subtask_id = %review.id,
        reviewed_subtask_id = %reviewed_subtask_id,
        "review subtask created"
    );

    Ok(review)
}

/// Handle a completed review: parse and store its report, then spawn the
/// fix flow when the score misses the threshold. Returns the fix subtask,
/// if one was created.
pub async fn handle_review_completed(
    pool: &PgPool,
    config: &ControlConfig,
    review_subtask_id: Uuid,
) -> ControlResult<Option<Subtask>> {
    let review = subtask_db::get_subtask(pool, review_subtask_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("subtask {review_subtask_id}")))?;

    if review.subtask_type != SubtaskType::CodeReview {
        return Err(ControlError::bad_state(format!(
            "subtask {review_subtask_id} is not a review"
        )));
    }

    let output = review.output.clone().unwrap_or_default();
    let report = parse_review_output(&output)?;

    // Persist the parsed report alongside the raw output.
    let stored = serde_json::json!({
        "review_result": {
            "review_completed_at": chrono::Utc::now(),
            "score": report.score,
            "issues": report.issues,
            "suggestions": report.suggestions,
            "summary": report.summary,
            "dimensions_checked": REVIEW_DIMENSIONS,
            "threshold": config.review_score_threshold,
        }
    });
    subtask_db::merge_output(pool, review.id, &stored).await?;

    let needs_fix = report.score < config.review_score_threshold;
    tracing::info!(
        review_subtask_id = %review_subtask_id,
        score = report.score,
        needs_fix,
        issues = report.issues.len(),
        "review result stored"
    );

    if !needs_fix {
        return Ok(None);
    }

    // Reviews spawned by the chain carry the reviewed subtask in their
    // metadata; template reviews reference it through their dependency.
    let metadata = review_metadata(&review);
    let reviewed_id = metadata
        .original_subtask_id
        .or_else(|| review.dependencies.first().copied())
        .ok_or_else(|| {
            ControlError::bad_state(format!(
                "review {review_subtask_id} has no reviewed subtask to trace back to"
            ))
        })?;

    create_fix_subtask(pool, config, reviewed_id, review.id, metadata.review_cycle).await
}

/// Create a fix subtask for a failing review, or escalate when the cycle
/// budget is spent. The fix depends on the review, carries the report as
/// input, and prefers the original tool/worker pairing.
pub async fn create_fix_subtask(
    pool: &PgPool,
    config: &ControlConfig,
    reviewed_subtask_id: Uuid,
    review_subtask_id: Uuid,
    review_cycle: u32,
) -> ControlResult<Option<Subtask>> {
    tracing::info!(
        reviewed_subtask_id = %reviewed_subtask_id,
        review_subtask_id = %review_subtask_id,
        review_cycle,
        "creating fix subtask"
    );

    let reviewed = subtask_db::get_subtask(pool, reviewed_subtask_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("subtask {reviewed_subtask_id}")))?;
    let review = subtask_db::get_subtask(pool, review_subtask_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("subtask {review_subtask_id}")))?;

    // The chain is anchored to the very first reviewed subtask; escalation
    // must flag that one, not an intermediate fix.
    let root_original = review_metadata(&review)
        .root_original_subtask_id
        .unwrap_or(reviewed_subtask_id);

    if review_cycle >= config.max_fix_cycles {
        tracing::warn!(
            root_original_subtask_id = %root_original,
            review_cycle,
            max = config.max_fix_cycles,
            "max fix cycles reached, escalating to human review"
        );
        escalate_to_human(pool, config, root_original, review_subtask_id).await?;
        return Ok(None);
    }

    let review_result = review
        .output
        .as_ref()
        .and_then(|o| o.get("review_result"))
        .cloned()
        .unwrap_or_default();

    let fix_input = serde_json::json!({
        "fix_input": {
            "original_subtask_id": reviewed.id,
            "review_subtask_id": review.id,
            "original_code": reviewed.output,
            "review_report": review_result,
            "review_cycle": review_cycle,
            "issues_to_fix": review_result.get("issues").cloned().unwrap_or_default(),
            "suggestions": review_result.get("suggestions").cloned().unwrap_or_default(),
        },
        "metadata": {
            "original_subtask_id": reviewed.id,
            "review_subtask_id": review.id,
            "root_original_subtask_id": root_original,
            "review_cycle": review_cycle,
            // Soft preference only: the allocator owns real placement.
            "preferred_worker": reviewed.assigned_worker,
        },
    });

    let name = format!("Fix Code: {} (Cycle {review_cycle})", reviewed.name);
    let description = fix_description(&reviewed, &review_result, config);

    let fix = subtask_db::insert_subtask(
        pool,
        &NewSubtask {
            task_id: reviewed.task_id,
            name: &name,
            description: &description,
            subtask_type: SubtaskType::CodeFix,
            recommended_tool: reviewed.assigned_tool.as_deref(),
            complexity: reviewed.complexity,
            priority: review.priority + FIX_PRIORITY_BUMP,
            dependencies: &[review.id],
            output: Some(fix_input),
        },
    )
    .await?;

    tracing::info!(fix_subtask_id = %fix.id, review_cycle, "fix subtask created");
    Ok(Some(fix))
}

/// Handle a completed fix: spawn the re-review for the fixed output,
/// tracked by the next cycle number, or escalate past the budget.
pub async fn handle_fix_completion(
    pool: &PgPool,
    config: &ControlConfig,
    fix_subtask_id: Uuid,
) -> ControlResult<Option<Subtask>> {
    tracing::info!(fix_subtask_id = %fix_subtask_id, "handling fix completion");

    let fix = subtask_db::get_subtask(pool, fix_subtask_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("subtask {fix_subtask_id}")))?;

    if fix.status != SubtaskStatus::Completed {
        return Err(ControlError::bad_state(format!(
            "fix subtask {fix_subtask_id} has status {}, expected completed",
            fix.status
        )));
    }

    let metadata = review_metadata(&fix);
    let Some(root_id) = metadata
        .root_original_subtask_id
        .or(metadata.original_subtask_id)
    else {
        return Err(ControlError::bad_state(format!(
            "fix subtask {fix_subtask_id} is missing its original subtask reference"
        )));
    };

    let next_cycle = metadata.review_cycle + 1;
    if next_cycle > config.max_fix_cycles {
        tracing::warn!(
            fix_subtask_id = %fix_subtask_id,
            next_cycle,
            "max fix cycles reached after fix, escalating"
        );
        escalate_to_human(pool, config, root_id, fix_subtask_id).await?;
        return Ok(None);
    }

    // The fix's own output is what gets re-reviewed.
    let review = create_review_subtask(pool, fix_subtask_id, next_cycle).await?;

    // Keep the chain anchored to the very first subtask.
    subtask_db::merge_output(
        pool,
        review.id,
        &serde_json::json!({
            "metadata": {
                "original_subtask_id": fix_subtask_id,
                "root_original_subtask_id": root_id,
                "immediate_parent_subtask_id": fix_subtask_id,
                "review_cycle": next_cycle,
            }
        }),
    )
    .await?;

    Ok(Some(review))
}

/// One entry in a review chain listing.
#[derive(Debug, Clone, Serialize)]
pub struct ChainEntry {
    pub subtask_id: Uuid,
    pub subtask_type: SubtaskType,
    pub name: String,
    pub status: SubtaskStatus,
    pub review_cycle: u32,
    pub score: Option<f64>,
}

/// The full review/fix lineage of a subtask, in cycle order.
pub async fn review_chain(pool: &PgPool, original_subtask_id: Uuid) -> Result<Vec<ChainEntry>> {
    let Some(original) = subtask_db::get_subtask(pool, original_subtask_id).await? else {
        return Ok(Vec::new());
    };

    let mut chain = Vec::new();
    let siblings = subtask_db::list_for_task(pool, original.task_id).await?;

    for subtask in siblings.iter().filter(|s| {
        matches!(
            s.subtask_type,
            SubtaskType::CodeReview | SubtaskType::CodeFix
        )
    }) {
        let metadata = review_metadata(subtask);
        let belongs = metadata.original_subtask_id == Some(original_subtask_id)
            || metadata.root_original_subtask_id == Some(original_subtask_id);
        if !belongs {
            continue;
        }

        let score = subtask
            .output
            .as_ref()
            .and_then(|o| o.get("review_result"))
            .and_then(|r| r.get("score"))
            .and_then(|s| s.as_f64());

        chain.push(ChainEntry {
            subtask_id: subtask.id,
            subtask_type: subtask.subtask_type,
            name: subtask.name.clone(),
            status: subtask.status,
            review_cycle: metadata.review_cycle,
            score,
        });
    }

    chain.sort_by_key(|e| e.review_cycle);
    Ok(chain)
}

/// Park the original subtask for a human: status `correcting` plus an
/// escalation record in its output.
async fn escalate_to_human(
    pool: &PgPool,
    config: &ControlConfig,
    original_subtask_id: Uuid,
    last_review_subtask_id: Uuid,
) -> Result<()> {
    tracing::info!(
        original_subtask_id = %original_subtask_id,
        "escalating review chain to human review"
    );

    let escalation = serde_json::json!({
        "escalation": {
            "escalated_at": chrono::Utc::now(),
            "reason": format!("max review-fix cycles ({}) reached", config.max_fix_cycles),
            "last_review_subtask_id": last_review_subtask_id,
            "requires_human_review": true,
        }
    });
    subtask_db::merge_output(pool, original_subtask_id, &escalation).await?;
    subtask_db::set_status(pool, original_subtask_id, SubtaskStatus::Correcting).await?;

    Ok(())
}

#[derive(Debug, Default)]
struct ChainMetadata {
    original_subtask_id: Option<Uuid>,
    root_original_subtask_id: Option<Uuid>,
    review_cycle: u32,
}

fn review_metadata(subtask: &Subtask) -> ChainMetadata {
    let Some(metadata) = subtask.output.as_ref().and_then(|o| o.get("metadata")) else {
        return ChainMetadata::default();
    };

    let as_uuid = |key: &str| {
        metadata
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    };

    ChainMetadata {
        original_subtask_id: as_uuid("original_subtask_id"),
        root_original_subtask_id: as_uuid("root_original_subtask_id"),
        review_cycle: metadata
            .get("review_cycle")
            .and_then(|v| v.as_u64())
            .unwrap_or(1) as u32,
    }
}

async fn find_review(
    pool: &PgPool,
    reviewed: &Subtask,
    review_cycle: u32,
) -> Result<Option<Subtask>> {
    let reviews =
        subtask_db::list_for_task_by_type(pool, reviewed.task_id, SubtaskType::CodeReview).await?;

    Ok(reviews.into_iter().find(|r| {
        let metadata = review_metadata(r);
        metadata.original_subtask_id == Some(reviewed.id) && metadata.review_cycle == review_cycle
    }))
}

fn review_description(reviewed: &Subtask, review_cycle: u32) -> String {
    format!(
        "Review the code generated for: {}\n\n\
         Original Description: {}\n\n\
         Review Cycle: {review_cycle}\n\n\
         Review Dimensions:\n\
         - Syntax: Check for syntax errors and language best practices\n\
         - Style: Evaluate code style, formatting, and naming conventions\n\
         - Logic: Verify logical correctness and algorithm efficiency\n\
         - Security: Identify security vulnerabilities and risks\n\
         - Readability: Assess code clarity and maintainability\n\n\
         Provide a structured review with:\n\
         1. Overall score (0-10)\n\
         2. Issues found with severity levels\n\
         3. Suggestions for improvement\n\
         4. Summary of findings",
        reviewed.name, reviewed.description
    )
}

fn fix_description(
    reviewed: &Subtask,
    review_result: &serde_json::Value,
    config: &ControlConfig,
) -> String {
    let score = review_result
        .get("score")
        .and_then(|v| v.as_f64())
        .unwrap_or(0.0);

    let issues_text: String = review_result
        .get("issues")
        .and_then(|v| v.as_array())
        .map(|issues| {
            issues
                .iter()
                .take(5)
                .map(|issue| {
                    format!(
                        "- [{}] {}",
                        issue
                            .get("severity")
                            .and_then(|s| s.as_str())
                            .unwrap_or("medium"),
                        issue
                            .get("description")
                            .and_then(|s| s.as_str())
                            .unwrap_or("N/A"),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    format!(
        "Fix the code based on review feedback for: {}\n\n\
         Review Score: {score}/{} (threshold)\n\n\
         Critical Issues to Address:\n{issues_text}\n\n\
         Original Task: {}\n\n\
         Requirements:\n\
         - Address all high-severity issues\n\
         - Implement suggested improvements\n\
         - Maintain original functionality\n\
         - Ensure code quality meets review threshold",
        reviewed.name, config.review_score_threshold, reviewed.description
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_review() {
        let output = serde_json::json!({
            "score": 7.5,
            "issues": [{"dimension": "style", "severity": "low", "description": "nit"}],
            "suggestions": [],
            "summary": "looks fine",
        });
        let report = parse_review_output(&output).unwrap();
        assert_eq!(report.score, 7.5);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.summary, "looks fine");
    }

    #[test]
    fn parse_review_missing_score() {
        let output = serde_json::json!({"issues": []});
        assert!(matches!(
            parse_review_output(&output).unwrap_err(),
            ControlError::Invalid(_)
        ));
    }

    #[test]
    fn parse_review_score_out_of_range() {
        let output = serde_json::json!({"score": 11.0});
        assert!(matches!(
            parse_review_output(&output).unwrap_err(),
            ControlError::Invalid(_)
        ));
    }

    #[test]
    fn parse_review_defaults_optional_fields() {
        let output = serde_json::json!({"score": 9.0});
        let report = parse_review_output(&output).unwrap();
        assert!(report.issues.is_empty());
        assert!(report.suggestions.is_empty());
        assert_eq!(report.summary, "");
    }
}

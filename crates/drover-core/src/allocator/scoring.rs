//! Pure scoring functions for worker selection.
//!
//! `total = w_tool * tool + w_resources * resources + w_privacy * privacy`,
//! with each component in [0, 1].

use drover_db::models::{PrivacyLevel, Worker};

use crate::config::ControlConfig;

/// Tools that run models on the worker itself.
pub const LOCAL_TOOLS: &[&str] = &["ollama"];

/// Tools backed by hosted model APIs.
pub const CLOUD_TOOLS: &[&str] = &["claude_code", "gemini_cli"];

pub const TOOL_SCORE_PERFECT_MATCH: f64 = 1.0;
pub const TOOL_SCORE_PARTIAL_MATCH: f64 = 0.5;
pub const TOOL_SCORE_NO_TOOLS: f64 = 0.0;

/// Contribution of a resource component whose usage is unknown.
pub const RESOURCE_SCORE_UNKNOWN: f64 = 0.5;

pub const PRIVACY_SCORE_NORMAL: f64 = 1.0;
pub const PRIVACY_SCORE_LOCAL_ONLY: f64 = 1.0;
pub const PRIVACY_SCORE_LOCAL_WITH_CLOUD: f64 = 0.8;
pub const PRIVACY_SCORE_CLOUD_ONLY: f64 = 0.5;
pub const PRIVACY_SCORE_NO_TOOLS: f64 = 0.0;

const RESOURCE_WEIGHT_CPU: f64 = 0.4;
const RESOURCE_WEIGHT_MEMORY: f64 = 0.4;
const RESOURCE_WEIGHT_DISK: f64 = 0.2;

/// Normalised scoring weights.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub tool_match: f64,
    pub resources: f64,
    pub privacy: f64,
}

impl Weights {
    /// Read weights from config. Weights that do not sum to 1 are
    /// normalised with a warning; a degenerate all-zero set falls back to
    /// the documented defaults.
    pub fn from_config(config: &ControlConfig) -> Self {
        let tool = config.allocator_weight_tool_match;
        let resources = config.allocator_weight_resources;
        let privacy = config.allocator_weight_privacy;

        let sum = tool + resources + privacy;
        if sum <= f64::EPSILON {
            tracing::warn!("allocator weights sum to zero, using defaults");
            return Self {
                tool_match: 0.5,
                resources: 0.3,
                privacy: 0.2,
            };
        }
        if (sum - 1.0).abs() > 1e-9 {
            tracing::warn!(sum, "allocator weights do not sum to 1.0, normalising");
        }
        Self {
            tool_match: tool / sum,
            resources: resources / sum,
            privacy: privacy / sum,
        }
    }
}

/// Tool matching: 1.0 for the recommended tool (or any tool when nothing
/// is recommended), 0.5 for a mismatch with other tools available, 0.0 for
/// a toolless worker.
pub fn tool_score(recommended: Option<&str>, tools: &[String]) -> f64 {
    match recommended {
        None | Some("") => {
            if tools.is_empty() {
                TOOL_SCORE_NO_TOOLS
            } else {
                TOOL_SCORE_PERFECT_MATCH
            }
        }
        Some(tool) => {
            if tools.is_empty() {
                TOOL_SCORE_NO_TOOLS
            } else if tools.iter().any(|t| t == tool) {
                TOOL_SCORE_PERFECT_MATCH
            } else {
                TOOL_SCORE_PARTIAL_MATCH
            }
        }
    }
}

fn component_score(usage_percent: Option<f32>) -> f64 {
    match usage_percent {
        Some(pct) => (100.0 - f64::from(pct)).max(0.0) / 100.0,
        None => RESOURCE_SCORE_UNKNOWN,
    }
}

/// Resource availability: lower usage scores higher. CPU and memory carry
/// 0.4 each, disk 0.2; an unknown component contributes 0.5.
pub fn resource_score(
    cpu_percent: Option<f32>,
    memory_percent: Option<f32>,
    disk_percent: Option<f32>,
) -> f64 {
    component_score(cpu_percent) * RESOURCE_WEIGHT_CPU
        + component_score(memory_percent) * RESOURCE_WEIGHT_MEMORY
        + component_score(disk_percent) * RESOURCE_WEIGHT_DISK
}

/// Privacy compatibility. Sensitive tasks prefer local-only workers,
/// tolerate mixed fleets, and accept cloud-only workers at half score.
pub fn privacy_score(privacy: PrivacyLevel, tools: &[String]) -> f64 {
    if tools.is_empty() {
        return PRIVACY_SCORE_NO_TOOLS;
    }
    if privacy == PrivacyLevel::Normal {
        return PRIVACY_SCORE_NORMAL;
    }

    let has_local = tools.iter().any(|t| LOCAL_TOOLS.contains(&t.as_str()));
    let has_cloud = tools.iter().any(|t| CLOUD_TOOLS.contains(&t.as_str()));

    if has_local && !has_cloud {
        PRIVACY_SCORE_LOCAL_ONLY
    } else if has_local {
        PRIVACY_SCORE_LOCAL_WITH_CLOUD
    } else {
        PRIVACY_SCORE_CLOUD_ONLY
    }
}

/// Full weighted score of one worker for one subtask.
pub fn worker_score(
    weights: Weights,
    worker: &Worker,
    recommended_tool: Option<&str>,
    privacy: PrivacyLevel,
) -> f64 {
    let tool = tool_score(recommended_tool, &worker.tools);
    let resources = resource_score(
        worker.cpu_percent,
        worker.memory_percent,
        worker.disk_percent,
    );
    let priv_score = privacy_score(privacy, &worker.tools);

    weights.tool_match * tool + weights.resources * resources + weights.privacy * priv_score
}

/// Combined resource usage for tie-breaking; unknown components count as
/// moderate load.
pub fn combined_usage(worker: &Worker) -> f64 {
    let part = |v: Option<f32>| v.map(f64::from).unwrap_or(50.0);
    part(worker.cpu_percent) + part(worker.memory_percent) + part(worker.disk_percent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drover_db::models::WorkerStatus;
    use uuid::Uuid;

    fn worker(tools: &[&str], cpu: Option<f32>, mem: Option<f32>, disk: Option<f32>) -> Worker {
        Worker {
            id: Uuid::new_v4(),
            machine_id: "m".into(),
            machine_name: "m".into(),
            status: WorkerStatus::Online,
            tools: tools.iter().map(|t| t.to_string()).collect(),
            cpu_percent: cpu,
            memory_percent: mem,
            disk_percent: disk,
            system_info: serde_json::json!({}),
            last_heartbeat: None,
            registered_at: Utc::now(),
        }
    }

    fn default_weights() -> Weights {
        Weights::from_config(&ControlConfig::default())
    }

    #[test]
    fn tool_score_cases() {
        let tools = vec!["claude_code".to_string(), "ollama".to_string()];
        assert_eq!(tool_score(Some("claude_code"), &tools), 1.0);
        assert_eq!(tool_score(Some("gemini_cli"), &tools), 0.5);
        assert_eq!(tool_score(Some("claude_code"), &[]), 0.0);
        assert_eq!(tool_score(None, &tools), 1.0);
        assert_eq!(tool_score(None, &[]), 0.0);
        assert_eq!(tool_score(Some(""), &tools), 1.0);
    }

    #[test]
    fn resource_score_weighs_components() {
        // 20/30/10 usage: 0.4*0.8 + 0.4*0.7 + 0.2*0.9 = 0.78
        let score = resource_score(Some(20.0), Some(30.0), Some(10.0));
        assert!((score - 0.78).abs() < 1e-9);
    }

    #[test]
    fn unknown_resource_components_score_half() {
        let score = resource_score(None, None, None);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn overloaded_components_floor_at_zero() {
        // A component reporting > 100% usage contributes zero, not a
        // negative score.
        let score = resource_score(Some(120.0), Some(100.0), Some(100.0));
        assert!((score - 0.0).abs() < 1e-9);
    }

    #[test]
    fn privacy_score_cases() {
        let local_only = vec!["ollama".to_string()];
        let cloud_only = vec!["claude_code".to_string()];
        let mixed = vec!["ollama".to_string(), "gemini_cli".to_string()];

        assert_eq!(privacy_score(PrivacyLevel::Normal, &cloud_only), 1.0);
        assert_eq!(privacy_score(PrivacyLevel::Sensitive, &local_only), 1.0);
        assert_eq!(privacy_score(PrivacyLevel::Sensitive, &mixed), 0.8);
        assert_eq!(privacy_score(PrivacyLevel::Sensitive, &cloud_only), 0.5);
        assert_eq!(privacy_score(PrivacyLevel::Sensitive, &[]), 0.0);
    }

    #[test]
    fn weights_normalise_when_sum_is_off() {
        let mut config = ControlConfig::default();
        config.allocator_weight_tool_match = 1.0;
        config.allocator_weight_resources = 1.0;
        config.allocator_weight_privacy = 2.0;

        let weights = Weights::from_config(&config);
        assert!((weights.tool_match - 0.25).abs() < 1e-9);
        assert!((weights.resources - 0.25).abs() < 1e-9);
        assert!((weights.privacy - 0.5).abs() < 1e-9);
    }

    #[test]
    fn dominance_implies_higher_total() {
        // w1 dominates w2 on every component, so no weighting may prefer w2.
        let w1 = worker(&["claude_code"], Some(10.0), Some(10.0), Some(10.0));
        let w2 = worker(&["ollama"], Some(90.0), Some(90.0), Some(90.0));

        let weights = default_weights();
        let s1 = worker_score(weights, &w1, Some("claude_code"), PrivacyLevel::Normal);
        let s2 = worker_score(weights, &w2, Some("claude_code"), PrivacyLevel::Normal);
        assert!(s1 > s2);
    }

    #[test]
    fn mismatched_tool_still_scores_positive() {
        // One online worker with only ollama, task wants claude_code:
        // 0.5*0.5 + 0.3*resources + 0.2*1.0 > 0 for a normal task, so the
        // allocator assigns with a tool mismatch rather than starving.
        let w = worker(&["ollama"], Some(50.0), Some(50.0), Some(50.0));
        let score = worker_score(
            default_weights(),
            &w,
            Some("claude_code"),
            PrivacyLevel::Normal,
        );
        assert!(score > 0.0);
    }

    #[test]
    fn sensitive_task_prefers_local_worker() {
        let local = worker(&["ollama"], Some(50.0), Some(50.0), Some(50.0));
        let cloud = worker(&["claude_code"], Some(50.0), Some(50.0), Some(50.0));

        let weights = default_weights();
        let s_local = worker_score(weights, &local, None, PrivacyLevel::Sensitive);
        let s_cloud = worker_score(weights, &cloud, None, PrivacyLevel::Sensitive);
        assert!(s_local > s_cloud);
    }

    #[test]
    fn combined_usage_tie_break_orders_by_load() {
        let light = worker(&[], Some(10.0), Some(10.0), Some(10.0));
        let heavy = worker(&[], Some(70.0), Some(70.0), Some(70.0));
        assert!(combined_usage(&light) < combined_usage(&heavy));
    }
}

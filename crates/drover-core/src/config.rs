//! Control-plane configuration, read once at startup.

use std::env;
use std::time::Duration;

/// All tunables of the control plane. Defaults match the documented
/// deployment values; every field can be overridden with a `DROVER_*`
/// environment variable.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval: Duration,
    /// A worker missing heartbeats for this long is considered offline.
    pub heartbeat_timeout: Duration,
    /// System-wide cap on concurrently executing subtasks.
    pub max_concurrent_subtasks: usize,
    /// Per-worker cap; the "one current task per worker" slot model.
    pub max_subtasks_per_worker: usize,
    /// Interval between scheduler cycles.
    pub scheduler_interval: Duration,
    /// Upper bound on queue-drain iterations per requeue pass.
    pub max_queue_allocation_attempts: usize,

    /// Allocator weight for tool matching.
    pub allocator_weight_tool_match: f64,
    /// Allocator weight for resource availability.
    pub allocator_weight_resources: f64,
    /// Allocator weight for privacy compatibility.
    pub allocator_weight_privacy: f64,

    /// CPU usage (%) above which an assignment is logged as overloaded.
    pub resource_threshold_cpu_high: f64,
    pub resource_threshold_memory_high: f64,
    pub resource_threshold_disk_high: f64,

    /// Evaluations below this overall score trigger a checkpoint.
    pub evaluation_threshold: f64,
    /// Review scores below this spawn a fix subtask.
    pub review_score_threshold: f64,
    /// Review-fix rounds allowed before human escalation.
    pub max_fix_cycles: u32,

    /// Completed-subtask count between periodic checkpoint candidates.
    pub checkpoint_subtask_interval: i64,
    /// Pending-or-failed corrections per subtask before escalation.
    pub checkpoint_max_correction_cycles: i64,
    /// Task wall-clock hours before the timeout trigger escalates.
    pub checkpoint_timeout_hours: i64,

    pub checkpoint_enable_error_trigger: bool,
    pub checkpoint_enable_evaluation_trigger: bool,
    pub checkpoint_enable_periodic_trigger: bool,
    pub checkpoint_enable_timeout_trigger: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_concurrent_subtasks: 20,
            max_subtasks_per_worker: 1,
            scheduler_interval: Duration::from_secs(30),
            max_queue_allocation_attempts: 50,
            allocator_weight_tool_match: 0.5,
            allocator_weight_resources: 0.3,
            allocator_weight_privacy: 0.2,
            resource_threshold_cpu_high: 80.0,
            resource_threshold_memory_high: 85.0,
            resource_threshold_disk_high: 90.0,
            evaluation_threshold: 7.0,
            review_score_threshold: 6.0,
            max_fix_cycles: 2,
            checkpoint_subtask_interval: 5,
            checkpoint_max_correction_cycles: 3,
            checkpoint_timeout_hours: 24,
            checkpoint_enable_error_trigger: true,
            checkpoint_enable_evaluation_trigger: true,
            checkpoint_enable_periodic_trigger: true,
            checkpoint_enable_timeout_trigger: true,
        }
    }
}

impl ControlConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_u64("DROVER_HEARTBEAT_INTERVAL_SECS") {
            cfg.heartbeat_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("DROVER_HEARTBEAT_TIMEOUT_SECS") {
            cfg.heartbeat_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("DROVER_MAX_CONCURRENT_SUBTASKS") {
            cfg.max_concurrent_subtasks = v;
        }
        if let Some(v) = env_parse("DROVER_MAX_SUBTASKS_PER_WORKER") {
            cfg.max_subtasks_per_worker = v;
        }
        if let Some(v) = env_u64("DROVER_SCHEDULER_INTERVAL_SECS") {
            cfg.scheduler_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("DROVER_MAX_QUEUE_ALLOCATION_ATTEMPTS") {
            cfg.max_queue_allocation_attempts = v;
        }
        if let Some(v) = env_parse("DROVER_ALLOCATOR_WEIGHT_TOOL_MATCH") {
            cfg.allocator_weight_tool_match = v;
        }
        if let Some(v) = env_parse("DROVER_ALLOCATOR_WEIGHT_RESOURCES") {
            cfg.allocator_weight_resources = v;
        }
        if let Some(v) = env_parse("DROVER_ALLOCATOR_WEIGHT_PRIVACY") {
            cfg.allocator_weight_privacy = v;
        }
        if let Some(v) = env_parse("DROVER_RESOURCE_THRESHOLD_CPU_HIGH") {
            cfg.resource_threshold_cpu_high = v;
        }
        if let Some(v) = env_parse("DROVER_RESOURCE_THRESHOLD_MEMORY_HIGH") {
            cfg.resource_threshold_memory_high = v;
        }
        if let Some(v) = env_parse("DROVER_RESOURCE_THRESHOLD_DISK_HIGH") {
            cfg.resource_threshold_disk_high = v;
        }
        if let Some(v) = env_parse("DROVER_EVALUATION_THRESHOLD") {
            cfg.evaluation_threshold = v;
        }
        if let Some(v) = env_parse("DROVER_REVIEW_SCORE_THRESHOLD") {
            cfg.review_score_threshold = v;
        }
        if let Some(v) = env_parse("DROVER_MAX_FIX_CYCLES") {
            cfg.max_fix_cycles = v;
        }
        if let Some(v) = env_parse("DROVER_CHECKPOINT_SUBTASK_INTERVAL") {
            cfg.checkpoint_subtask_interval = v;
        }
        if let Some(v) = env_parse("DROVER_CHECKPOINT_MAX_CORRECTION_CYCLES") {
            cfg.checkpoint_max_correction_cycles = v;
        }
        if let Some(v) = env_parse("DROVER_CHECKPOINT_TIMEOUT_HOURS") {
            cfg.checkpoint_timeout_hours = v;
        }
        if let Some(v) = env_bool("DROVER_CHECKPOINT_ENABLE_ERROR_TRIGGER") {
            cfg.checkpoint_enable_error_trigger = v;
        }
        if let Some(v) = env_bool("DROVER_CHECKPOINT_ENABLE_EVALUATION_TRIGGER") {
            cfg.checkpoint_enable_evaluation_trigger = v;
        }
        if let Some(v) = env_bool("DROVER_CHECKPOINT_ENABLE_PERIODIC_TRIGGER") {
            cfg.checkpoint_enable_periodic_trigger = v;
        }
        if let Some(v) = env_bool("DROVER_CHECKPOINT_ENABLE_TIMEOUT_TRIGGER") {
            cfg.checkpoint_enable_timeout_trigger = v;
        }

        cfg
    }

    /// TTL for coordinator worker-status mirrors: twice the heartbeat
    /// interval, so one missed beat keeps the key and two expire it.
    pub fn worker_status_ttl(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_parse(name)
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().map(|v| {
        matches!(
            v.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task. Terminal statuses (completed, failed, cancelled) are
/// sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Initializing,
    InProgress,
    Checkpoint,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is a sink no further transition may leave.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::InProgress => "in_progress",
            Self::Checkpoint => "checkpoint",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "initializing" => Ok(Self::Initializing),
            "in_progress" => Ok(Self::InProgress),
            "checkpoint" => Ok(Self::Checkpoint),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a subtask.
///
/// `assigned_worker` is non-null iff the status is `queued` or `in_progress`;
/// `correcting` marks a subtask awaiting guided re-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
    Correcting,
}

impl SubtaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Correcting => "correcting",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskStatus {
    type Err = SubtaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "correcting" => Ok(Self::Correcting),
            other => Err(SubtaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubtaskStatus`] string.
#[derive(Debug, Clone)]
pub struct SubtaskStatusParseError(pub String);

impl fmt::Display for SubtaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask status: {:?}", self.0)
    }
}

impl std::error::Error for SubtaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of work a subtask represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubtaskType {
    CodeGeneration,
    CodeReview,
    CodeFix,
    TestGeneration,
    Documentation,
    Analysis,
    Other,
}

impl fmt::Display for SubtaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CodeGeneration => "code_generation",
            Self::CodeReview => "code_review",
            Self::CodeFix => "code_fix",
            Self::TestGeneration => "test_generation",
            Self::Documentation => "documentation",
            Self::Analysis => "analysis",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for SubtaskType {
    type Err = SubtaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code_generation" => Ok(Self::CodeGeneration),
            "code_review" => Ok(Self::CodeReview),
            "code_fix" => Ok(Self::CodeFix),
            "test_generation" => Ok(Self::TestGeneration),
            "documentation" => Ok(Self::Documentation),
            "analysis" => Ok(Self::Analysis),
            "other" => Ok(Self::Other),
            other => Err(SubtaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SubtaskType`] string.
#[derive(Debug, Clone)]
pub struct SubtaskTypeParseError(pub String);

impl fmt::Display for SubtaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid subtask type: {:?}", self.0)
    }
}

impl std::error::Error for SubtaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Status of a worker machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    /// Whether a worker in this status may be considered for assignment
    /// (it must additionally hold no current task).
    pub fn is_assignable(self) -> bool {
        matches!(self, Self::Online | Self::Idle)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------

/// Privacy classification of a task. Sensitive tasks steer toward workers
/// with local tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Normal,
    Sensitive,
}

impl fmt::Display for PrivacyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Sensitive => "sensitive",
        };
        f.write_str(s)
    }
}

impl FromStr for PrivacyLevel {
    type Err = PrivacyLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "sensitive" => Ok(Self::Sensitive),
            other => Err(PrivacyLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PrivacyLevel`] string.
#[derive(Debug, Clone)]
pub struct PrivacyLevelParseError(pub String);

impl fmt::Display for PrivacyLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid privacy level: {:?}", self.0)
    }
}

impl std::error::Error for PrivacyLevelParseError {}

// ---------------------------------------------------------------------------

/// How often a task pauses for human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    Low,
    Medium,
    High,
}

impl fmt::Display for CheckpointFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointFrequency {
    type Err = CheckpointFrequencyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(CheckpointFrequencyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CheckpointFrequency`] string.
#[derive(Debug, Clone)]
pub struct CheckpointFrequencyParseError(pub String);

impl fmt::Display for CheckpointFrequencyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint frequency: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointFrequencyParseError {}

// ---------------------------------------------------------------------------

/// Status of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    PendingReview,
    Approved,
    Corrected,
    Rejected,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Corrected => "corrected",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointStatus {
    type Err = CheckpointStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "corrected" => Ok(Self::Corrected),
            "rejected" => Ok(Self::Rejected),
            other => Err(CheckpointStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CheckpointStatus`] string.
#[derive(Debug, Clone)]
pub struct CheckpointStatusParseError(pub String);

impl fmt::Display for CheckpointStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid checkpoint status: {:?}", self.0)
    }
}

impl std::error::Error for CheckpointStatusParseError {}

// ---------------------------------------------------------------------------

/// Why a checkpoint was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Manual,
    ReviewIssuesFound,
    LowEvaluationScore,
    CodeGenerationComplete,
    Timeout,
    CycleLimit,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::ReviewIssuesFound => "review_issues_found",
            Self::LowEvaluationScore => "low_evaluation_score",
            Self::CodeGenerationComplete => "code_generation_complete",
            Self::Timeout => "timeout",
            Self::CycleLimit => "cycle_limit",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerReason {
    type Err = TriggerReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "review_issues_found" => Ok(Self::ReviewIssuesFound),
            "low_evaluation_score" => Ok(Self::LowEvaluationScore),
            "code_generation_complete" => Ok(Self::CodeGenerationComplete),
            "timeout" => Ok(Self::Timeout),
            "cycle_limit" => Ok(Self::CycleLimit),
            other => Err(TriggerReasonParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerReason`] string.
#[derive(Debug, Clone)]
pub struct TriggerReasonParseError(pub String);

impl fmt::Display for TriggerReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger reason: {:?}", self.0)
    }
}

impl std::error::Error for TriggerReasonParseError {}

// ---------------------------------------------------------------------------

/// Human decision recorded against a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserDecision {
    Accept,
    Correct,
    Reject,
}

impl fmt::Display for UserDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Accept => "accept",
            Self::Correct => "correct",
            Self::Reject => "reject",
        };
        f.write_str(s)
    }
}

impl FromStr for UserDecision {
    type Err = UserDecisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "correct" => Ok(Self::Correct),
            "reject" => Ok(Self::Reject),
            other => Err(UserDecisionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UserDecision`] string.
#[derive(Debug, Clone)]
pub struct UserDecisionParseError(pub String);

impl fmt::Display for UserDecisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid user decision: {:?}", self.0)
    }
}

impl std::error::Error for UserDecisionParseError {}

// ---------------------------------------------------------------------------

/// Outcome of a correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CorrectionResult {
    Pending,
    Success,
    Failed,
}

impl fmt::Display for CorrectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for CorrectionResult {
    type Err = CorrectionResultParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(CorrectionResultParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`CorrectionResult`] string.
#[derive(Debug, Clone)]
pub struct CorrectionResultParseError(pub String);

impl fmt::Display for CorrectionResultParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid correction result: {:?}", self.0)
    }
}

impl std::error::Error for CorrectionResultParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- the top-level unit of work submitted by a user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub status: TaskStatus,
    /// Always `floor(100 * completed / total)` while the DAG is non-empty.
    pub progress: i32,
    pub checkpoint_frequency: CheckpointFrequency,
    pub privacy_level: PrivacyLevel,
    /// Ordered tool preferences; order matters for fallback selection.
    pub tool_preferences: Vec<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A subtask -- one node of a task's dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub status: SubtaskStatus,
    pub progress: i32,
    pub subtask_type: SubtaskType,
    pub recommended_tool: Option<String>,
    pub assigned_worker: Option<Uuid>,
    pub assigned_tool: Option<String>,
    /// 1 (trivial) to 5 (hard).
    pub complexity: i32,
    /// Higher runs first within a task.
    pub priority: i32,
    /// Sibling subtask ids this one waits for; always within the same task.
    pub dependencies: Vec<Uuid>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    /// All dependency ids present in `completed`?
    pub fn deps_satisfied(&self, completed: &std::collections::HashSet<Uuid>) -> bool {
        self.dependencies.iter().all(|d| completed.contains(d))
    }
}

/// A worker machine hosting one or more AI coding tools.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: Uuid,
    /// Unique per machine; registration is idempotent on this.
    pub machine_id: String,
    pub machine_name: String,
    pub status: WorkerStatus,
    /// Ordered list of advertised tool names.
    pub tools: Vec<String>,
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub disk_percent: Option<f32>,
    pub system_info: serde_json::Value,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// A worker API key. Only the MAC of the plaintext is stored; the plaintext
/// is returned exactly once at issuance.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkerApiKey {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub prefix: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl WorkerApiKey {
    /// Not revoked and not past its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && self.expires_at.map(|e| e > now).unwrap_or(true)
    }
}

/// An evaluation report produced by the external evaluator for one subtask.
/// The freshest row per subtask is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Evaluation {
    pub id: Uuid,
    pub subtask_id: Uuid,
    pub code_quality: Option<f64>,
    pub completeness: Option<f64>,
    pub security: Option<f64>,
    pub architecture: Option<f64>,
    pub testability: Option<f64>,
    /// 0.0 to 10.0.
    pub overall_score: f64,
    pub details: serde_json::Value,
    pub evaluated_at: DateTime<Utc>,
}

/// A checkpoint -- a pause point with a snapshot of completed subtask ids
/// awaiting a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: CheckpointStatus,
    pub trigger_reason: TriggerReason,
    /// Subtask ids completed at trigger time.
    pub subtasks_completed: Vec<Uuid>,
    pub context: serde_json::Value,
    pub user_decision: Option<UserDecision>,
    pub decision_notes: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// A correction -- a guided re-execution of an already-completed subtask,
/// created by a `correct` checkpoint decision.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Correction {
    pub id: Uuid,
    pub checkpoint_id: Uuid,
    pub subtask_id: Uuid,
    pub correction_type: String,
    pub guidance: String,
    pub reference_files: Vec<String>,
    pub result: CorrectionResult,
    pub retry_count: i32,
    pub apply_to_future: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Initializing,
            TaskStatus::InProgress,
            TaskStatus::Checkpoint,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn task_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Checkpoint.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn subtask_status_display_roundtrip() {
        let variants = [
            SubtaskStatus::Pending,
            SubtaskStatus::Queued,
            SubtaskStatus::InProgress,
            SubtaskStatus::Completed,
            SubtaskStatus::Failed,
            SubtaskStatus::Cancelled,
            SubtaskStatus::Correcting,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SubtaskStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn subtask_status_invalid() {
        assert!("nope".parse::<SubtaskStatus>().is_err());
    }

    #[test]
    fn subtask_type_display_roundtrip() {
        let variants = [
            SubtaskType::CodeGeneration,
            SubtaskType::CodeReview,
            SubtaskType::CodeFix,
            SubtaskType::TestGeneration,
            SubtaskType::Documentation,
            SubtaskType::Analysis,
            SubtaskType::Other,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: SubtaskType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn worker_status_display_roundtrip() {
        let variants = [
            WorkerStatus::Online,
            WorkerStatus::Idle,
            WorkerStatus::Busy,
            WorkerStatus::Offline,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: WorkerStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn worker_status_assignable() {
        assert!(WorkerStatus::Online.is_assignable());
        assert!(WorkerStatus::Idle.is_assignable());
        assert!(!WorkerStatus::Busy.is_assignable());
        assert!(!WorkerStatus::Offline.is_assignable());
    }

    #[test]
    fn privacy_level_display_roundtrip() {
        for v in &[PrivacyLevel::Normal, PrivacyLevel::Sensitive] {
            let parsed: PrivacyLevel = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn checkpoint_frequency_display_roundtrip() {
        for v in &[
            CheckpointFrequency::Low,
            CheckpointFrequency::Medium,
            CheckpointFrequency::High,
        ] {
            let parsed: CheckpointFrequency = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn checkpoint_status_display_roundtrip() {
        let variants = [
            CheckpointStatus::PendingReview,
            CheckpointStatus::Approved,
            CheckpointStatus::Corrected,
            CheckpointStatus::Rejected,
        ];
        for v in &variants {
            let parsed: CheckpointStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn trigger_reason_display_roundtrip() {
        let variants = [
            TriggerReason::Manual,
            TriggerReason::ReviewIssuesFound,
            TriggerReason::LowEvaluationScore,
            TriggerReason::CodeGenerationComplete,
            TriggerReason::Timeout,
            TriggerReason::CycleLimit,
        ];
        for v in &variants {
            let parsed: TriggerReason = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn trigger_reason_invalid() {
        assert!("whim".parse::<TriggerReason>().is_err());
    }

    #[test]
    fn user_decision_display_roundtrip() {
        for v in &[
            UserDecision::Accept,
            UserDecision::Correct,
            UserDecision::Reject,
        ] {
            let parsed: UserDecision = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn correction_result_display_roundtrip() {
        for v in &[
            CorrectionResult::Pending,
            CorrectionResult::Success,
            CorrectionResult::Failed,
        ] {
            let parsed: CorrectionResult = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn api_key_active_checks() {
        let now = Utc::now();
        let mut key = WorkerApiKey {
            id: Uuid::new_v4(),
            worker_id: Uuid::new_v4(),
            prefix: "abcd1234".into(),
            key_hash: "deadbeef".into(),
            created_at: now,
            revoked_at: None,
            expires_at: None,
        };
        assert!(key.is_active(now));

        key.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(key.is_active(now));

        key.expires_at = Some(now - chrono::Duration::hours(1));
        assert!(!key.is_active(now));

        key.expires_at = None;
        key.revoked_at = Some(now);
        assert!(!key.is_active(now));
    }

    #[test]
    fn deps_satisfied_checks_all() {
        use std::collections::HashSet;

        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();
        let sub = Subtask {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            name: "n".into(),
            description: "d".into(),
            status: SubtaskStatus::Pending,
            progress: 0,
            subtask_type: SubtaskType::CodeGeneration,
            recommended_tool: None,
            assigned_worker: None,
            assigned_tool: None,
            complexity: 2,
            priority: 50,
            dependencies: vec![d1, d2],
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let mut completed = HashSet::new();
        assert!(!sub.deps_satisfied(&completed));
        completed.insert(d1);
        assert!(!sub.deps_satisfied(&completed));
        completed.insert(d2);
        assert!(sub.deps_satisfied(&completed));
    }
}

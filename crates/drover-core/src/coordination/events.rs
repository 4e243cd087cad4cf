//! Event payloads published on the coordination channels and the message
//! types exchanged over per-worker push channels.
//!
//! Every wire message carries a `type` discriminator and an ISO-8601
//! timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drover_db::models::{SubtaskStatus, TaskStatus, TriggerReason, UserDecision, WorkerStatus};

use super::keys;

/// Events consumed by UI subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskUpdate {
        task_id: Uuid,
        status: TaskStatus,
        progress: i32,
        timestamp: DateTime<Utc>,
    },
    WorkerUpdate {
        worker_id: Uuid,
        status: WorkerStatus,
        timestamp: DateTime<Utc>,
    },
    SubtaskComplete {
        subtask_id: Uuid,
        task_id: Uuid,
        status: SubtaskStatus,
        evaluation_score: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    CheckpointReached {
        checkpoint_id: Uuid,
        task_id: Uuid,
        trigger_reason: TriggerReason,
        context: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    CheckpointDecision {
        checkpoint_id: Uuid,
        task_id: Uuid,
        decision: UserDecision,
        task_status: TaskStatus,
        corrections_created: usize,
        timestamp: DateTime<Utc>,
    },
    CheckpointRollback {
        checkpoint_id: Uuid,
        task_id: Uuid,
        subtasks_reset: usize,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// The canonical channel this event is published on.
    pub fn channel(&self) -> &'static str {
        match self {
            Self::TaskUpdate { .. } => keys::EVENTS_TASK_UPDATE,
            Self::WorkerUpdate { .. } => keys::EVENTS_WORKER_UPDATE,
            Self::SubtaskComplete { .. } => keys::EVENTS_SUBTASK_COMPLETE,
            Self::CheckpointReached { .. }
            | Self::CheckpointDecision { .. }
            | Self::CheckpointRollback { .. } => keys::EVENTS_CHECKPOINT,
        }
    }

    pub fn task_update(task_id: Uuid, status: TaskStatus, progress: i32) -> Self {
        Self::TaskUpdate {
            task_id,
            status,
            progress,
            timestamp: Utc::now(),
        }
    }

    pub fn worker_update(worker_id: Uuid, status: WorkerStatus) -> Self {
        Self::WorkerUpdate {
            worker_id,
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn subtask_complete(
        subtask_id: Uuid,
        task_id: Uuid,
        status: SubtaskStatus,
        evaluation_score: Option<f64>,
    ) -> Self {
        Self::SubtaskComplete {
            subtask_id,
            task_id,
            status,
            evaluation_score,
            timestamp: Utc::now(),
        }
    }
}

/// Payload of a task push to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub subtask_id: Uuid,
    pub task_id: Uuid,
    pub description: String,
    pub assigned_tool: Option<String>,
    pub input_data: serde_json::Value,
}

/// Server -> worker messages on the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerPush {
    Connected {
        worker_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    TaskAssignment {
        data: TaskAssignment,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
}

/// Worker -> server messages on the push channel. `task_complete` is a
/// status echo; the durable result path is the idempotent upload endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerInbound {
    Ping,
    Status {
        status: WorkerStatus,
        #[serde(default)]
        current_task: Option<Uuid>,
    },
    TaskComplete {
        subtask_id: Uuid,
        status: SubtaskStatus,
    },
}

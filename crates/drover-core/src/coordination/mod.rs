//! Ephemeral coordination substrate: K/V with TTLs, the pending queue, the
//! in-progress set, hashes, pub/sub channels, and distributed locks.
//!
//! The substrate is capability-typed: the control plane depends only on
//! [`CoordinationStore`]. Everything stored here is a rebuildable mirror of
//! the durable store; on any conflict the database wins (see
//! `crate::recovery`).

pub mod events;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use drover_db::models::{SubtaskStatus, TaskStatus, WorkerStatus};

use crate::error::ControlResult;
use events::{Event, TaskAssignment, WorkerPush};

/// The primitive operations every coordination backend must provide.
///
/// Key families and channels follow fixed conventions (see [`keys`]); the
/// store itself is agnostic about their meaning.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // Strings with optional TTL.
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    /// Batch fetch: one round-trip for many keys, in input order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>>;

    // FIFO list (the pending queue).
    async fn queue_push(&self, queue: &str, value: &str) -> Result<()>;
    async fn queue_pop(&self, queue: &str) -> Result<Option<String>>;
    async fn queue_peek(&self, queue: &str) -> Result<Option<String>>;
    async fn queue_len(&self, queue: &str) -> Result<usize>;

    // Sets.
    async fn set_add(&self, set: &str, member: &str) -> Result<()>;
    async fn set_remove(&self, set: &str, member: &str) -> Result<()>;
    async fn set_members(&self, set: &str) -> Result<Vec<String>>;
    async fn set_card(&self, set: &str) -> Result<usize>;

    // Hashes with a TTL on the whole hash.
    async fn hash_set_all(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl: Option<Duration>,
    ) -> Result<()>;
    async fn hash_get_all(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    // Pub/sub.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<String>;

    // Set-if-absent lock with TTL.
    async fn acquire_lock(&self, resource: &str, holder: &str, ttl: Duration) -> Result<bool>;
    async fn release_lock(&self, resource: &str) -> Result<()>;
}

/// Key and channel naming conventions.
pub mod keys {
    use uuid::Uuid;

    pub const QUEUE_PENDING: &str = "queue:pending";
    pub const SET_IN_PROGRESS: &str = "subtasks:in_progress";
    pub const SET_ONLINE_WORKERS: &str = "workers:online";

    pub const EVENTS_TASK_UPDATE: &str = "events:task_update";
    pub const EVENTS_WORKER_UPDATE: &str = "events:worker_update";
    pub const EVENTS_SUBTASK_COMPLETE: &str = "events:subtask_complete";
    pub const EVENTS_CHECKPOINT: &str = "events:checkpoint";

    pub fn worker_status(id: Uuid) -> String {
        format!("worker:{id}:status")
    }

    pub fn worker_current_task(id: Uuid) -> String {
        format!("worker:{id}:current_task")
    }

    pub fn worker_info(id: Uuid) -> String {
        format!("worker:{id}:info")
    }

    pub fn worker_channel(id: Uuid) -> String {
        format!("worker:{id}:tasks")
    }

    pub fn task_status(id: Uuid) -> String {
        format!("task:{id}:status")
    }

    pub fn task_progress(id: Uuid) -> String {
        format!("task:{id}:progress")
    }

    pub fn subtask_status(id: Uuid) -> String {
        format!("subtask:{id}:status")
    }
}

/// Default TTL for `worker:{id}:current_task` slots. Generous: the slot is
/// refreshed on assignment and cleared on release; the TTL only reclaims
/// slots whose worker vanished without releasing.
const CURRENT_TASK_TTL: Duration = Duration::from_secs(600);

/// TTL for subtask/task status mirrors written outside of the hot path.
const STATUS_MIRROR_TTL: Duration = Duration::from_secs(3600);

/// High-level facade over a [`CoordinationStore`], owning the key
/// conventions and event serialisation.
#[derive(Clone)]
pub struct Coordination {
    store: Arc<dyn CoordinationStore>,
}

impl Coordination {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// An in-memory coordination layer (single-process deployments, tests).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(memory::MemoryStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Worker state
    // ------------------------------------------------------------------

    /// Mirror a worker's status with a TTL and maintain the online set.
    pub async fn set_worker_status(
        &self,
        worker_id: Uuid,
        status: WorkerStatus,
        ttl: Duration,
    ) -> Result<()> {
        self.store
            .set_ex(&keys::worker_status(worker_id), &status.to_string(), ttl)
            .await?;

        if status == WorkerStatus::Online {
            self.store
                .set_add(keys::SET_ONLINE_WORKERS, &worker_id.to_string())
                .await?;
        } else {
            self.store
                .set_remove(keys::SET_ONLINE_WORKERS, &worker_id.to_string())
                .await?;
        }
        Ok(())
    }

    pub async fn worker_status(&self, worker_id: Uuid) -> Result<Option<WorkerStatus>> {
        let raw = self.store.get(&keys::worker_status(worker_id)).await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    pub async fn online_workers(&self) -> Result<Vec<Uuid>> {
        let members = self.store.set_members(keys::SET_ONLINE_WORKERS).await?;
        Ok(members.iter().filter_map(|m| m.parse().ok()).collect())
    }

    /// Claim a worker's slot: holding `worker:{id}:current_task` is holding
    /// the worker.
    pub async fn set_worker_current_task(&self, worker_id: Uuid, task_id: Uuid) -> Result<()> {
        self.store
            .set_ex(
                &keys::worker_current_task(worker_id),
                &task_id.to_string(),
                CURRENT_TASK_TTL,
            )
            .await
    }

    pub async fn worker_current_task(&self, worker_id: Uuid) -> Result<Option<String>> {
        self.store.get(&keys::worker_current_task(worker_id)).await
    }

    pub async fn clear_worker_current_task(&self, worker_id: Uuid) -> Result<()> {
        self.store.del(&keys::worker_current_task(worker_id)).await
    }

    /// Batch lookup of `worker_id -> current_task` in one round-trip. The
    /// allocator calls this once per cycle instead of once per worker.
    pub async fn worker_current_tasks(
        &self,
        worker_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Option<String>>> {
        let keys: Vec<String> = worker_ids
            .iter()
            .map(|id| keys::worker_current_task(*id))
            .collect();
        let values = self.store.get_many(&keys).await?;

        Ok(worker_ids.iter().copied().zip(values).collect())
    }

    /// Cache worker descriptive fields as a hash with TTL.
    pub async fn cache_worker_info(
        &self,
        worker_id: Uuid,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        self.store
            .hash_set_all(&keys::worker_info(worker_id), fields, Some(ttl))
            .await
    }

    pub async fn worker_info(&self, worker_id: Uuid) -> Result<Option<HashMap<String, String>>> {
        self.store.hash_get_all(&keys::worker_info(worker_id)).await
    }

    // ------------------------------------------------------------------
    // Task / subtask mirrors
    // ------------------------------------------------------------------

    pub async fn set_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<()> {
        self.store
            .set(&keys::task_status(task_id), &status.to_string())
            .await
    }

    pub async fn task_status(&self, task_id: Uuid) -> Result<Option<TaskStatus>> {
        let raw = self.store.get(&keys::task_status(task_id)).await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    pub async fn set_task_progress(&self, task_id: Uuid, progress: i32) -> Result<()> {
        self.store
            .set(&keys::task_progress(task_id), &progress.to_string())
            .await
    }

    pub async fn task_progress(&self, task_id: Uuid) -> Result<Option<i32>> {
        let raw = self.store.get(&keys::task_progress(task_id)).await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    /// Drop all mirror keys of a finished task.
    pub async fn clear_task_keys(&self, task_id: Uuid) -> Result<()> {
        self.store.del(&keys::task_status(task_id)).await?;
        self.store.del(&keys::task_progress(task_id)).await?;
        Ok(())
    }

    pub async fn set_subtask_status(&self, subtask_id: Uuid, status: SubtaskStatus) -> Result<()> {
        self.store
            .set_ex(
                &keys::subtask_status(subtask_id),
                &status.to_string(),
                STATUS_MIRROR_TTL,
            )
            .await
    }

    // ------------------------------------------------------------------
    // Pending queue and in-progress set
    // ------------------------------------------------------------------

    pub async fn push_to_queue(&self, subtask_id: Uuid) -> Result<()> {
        self.store
            .queue_push(keys::QUEUE_PENDING, &subtask_id.to_string())
            .await
    }

    pub async fn pop_from_queue(&self) -> Result<Option<String>> {
        self.store.queue_pop(keys::QUEUE_PENDING).await
    }

    pub async fn peek_queue(&self) -> Result<Option<String>> {
        self.store.queue_peek(keys::QUEUE_PENDING).await
    }

    pub async fn queue_len(&self) -> Result<usize> {
        self.store.queue_len(keys::QUEUE_PENDING).await
    }

    pub async fn mark_in_progress(&self, subtask_id: Uuid) -> Result<()> {
        self.store
            .set_add(keys::SET_IN_PROGRESS, &subtask_id.to_string())
            .await
    }

    pub async fn remove_from_in_progress(&self, subtask_id: Uuid) -> Result<()> {
        self.store
            .set_remove(keys::SET_IN_PROGRESS, &subtask_id.to_string())
            .await
    }

    pub async fn in_progress_count(&self) -> Result<usize> {
        self.store.set_card(keys::SET_IN_PROGRESS).await
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Serialise and publish an event to its canonical channel.
    pub async fn publish_event(&self, event: &Event) -> Result<usize> {
        let payload = serde_json::to_string(event)?;
        self.store.publish(event.channel(), &payload).await
    }

    pub fn subscribe_events(&self, channel: &str) -> broadcast::Receiver<String> {
        self.store.subscribe(channel)
    }

    /// Push a task assignment onto a worker's private channel. Delivery is
    /// at-least-once; the result upload path is idempotent by subtask id.
    pub async fn push_task_assignment(
        &self,
        worker_id: Uuid,
        assignment: TaskAssignment,
    ) -> Result<usize> {
        let message = WorkerPush::TaskAssignment {
            data: assignment,
            timestamp: chrono::Utc::now(),
        };
        let payload = serde_json::to_string(&message)?;
        self.store
            .publish(&keys::worker_channel(worker_id), &payload)
            .await
    }

    pub fn subscribe_worker_channel(&self, worker_id: Uuid) -> broadcast::Receiver<String> {
        self.store.subscribe(&keys::worker_channel(worker_id))
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    pub async fn acquire_lock(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.store.acquire_lock(resource, holder, ttl).await
    }

    pub async fn release_lock(&self, resource: &str) -> Result<()> {
        self.store.release_lock(resource).await
    }

    /// Run `op` under a coordination lock, releasing it on every exit path.
    /// Returns `Ok(None)` when the lock is already held elsewhere.
    pub async fn with_lock<T, F>(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        op: F,
    ) -> ControlResult<Option<T>>
    where
        F: std::future::Future<Output = ControlResult<T>>,
    {
        if !self.acquire_lock(resource, holder, ttl).await? {
            return Ok(None);
        }
        let result = op.await;
        if let Err(e) = self.release_lock(resource).await {
            tracing::warn!(resource, error = %e, "failed to release coordination lock");
        }
        result.map(Some)
    }
}

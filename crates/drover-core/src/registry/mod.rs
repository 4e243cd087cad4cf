//! Worker registry: registration, heartbeats, lifecycle, and the offline
//! reaper.

pub mod apikey;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::{Worker, WorkerStatus};
use drover_db::queries::workers as worker_db;

use crate::config::ControlConfig;
use crate::coordination::Coordination;
use crate::coordination::events::Event;
use crate::error::{ControlError, ControlResult};

/// Resource usage reported in a heartbeat. Unknown components stay `None`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub disk_percent: Option<f32>,
}

/// Register a worker, or bring an existing registration back online.
///
/// Idempotent on `machine_id`: repeat calls update the row in place and
/// reset the status to online. Mirrors the status with the heartbeat TTL so
/// a silent worker expires out of the coordination layer on its own.
pub async fn register_worker(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    machine_id: &str,
    machine_name: &str,
    system_info: &serde_json::Value,
    tools: &[String],
) -> Result<Worker> {
    tracing::info!(machine_id, machine_name, ?tools, "registering worker");

    let worker =
        worker_db::upsert_worker(pool, machine_id, machine_name, system_info, tools).await?;

    coord
        .set_worker_status(worker.id, WorkerStatus::Online, config.worker_status_ttl())
        .await?;
    if let Err(e) = coord
        .publish_event(&Event::worker_update(worker.id, WorkerStatus::Online))
        .await
    {
        tracing::warn!(worker_id = %worker.id, error = %e, "failed to publish worker update");
    }

    tracing::info!(worker_id = %worker.id, machine_id, "worker registered");
    Ok(worker)
}

/// Apply a heartbeat: resources, status, `last_heartbeat = now`, and the
/// TTL'd coordination mirror. An expired mirror key is how the offline
/// reaper observes a missing beat.
pub async fn heartbeat(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    worker_id: Uuid,
    status: WorkerStatus,
    resources: ResourceUsage,
    current_task: Option<Uuid>,
) -> ControlResult<()> {
    tracing::debug!(worker_id = %worker_id, %status, "worker heartbeat");

    let rows = worker_db::apply_heartbeat(
        pool,
        worker_id,
        status,
        resources.cpu_percent,
        resources.memory_percent,
        resources.disk_percent,
    )
    .await?;

    if rows == 0 {
        return Err(ControlError::not_found(format!("worker {worker_id}")));
    }

    coord
        .set_worker_status(worker_id, status, config.worker_status_ttl())
        .await
        .map_err(ControlError::Internal)?;

    if let Some(task_id) = current_task {
        coord
            .set_worker_current_task(worker_id, task_id)
            .await
            .map_err(ControlError::Internal)?;
    }

    Ok(())
}

/// Graceful shutdown path: mark the worker offline and update mirrors.
pub async fn unregister_worker(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
    worker_id: Uuid,
) -> ControlResult<()> {
    tracing::info!(worker_id = %worker_id, "unregistering worker");

    let rows = worker_db::set_worker_status(pool, worker_id, WorkerStatus::Offline).await?;
    if rows == 0 {
        return Err(ControlError::not_found(format!("worker {worker_id}")));
    }

    coord
        .set_worker_status(worker_id, WorkerStatus::Offline, config.worker_status_ttl())
        .await
        .map_err(ControlError::Internal)?;
    coord
        .clear_worker_current_task(worker_id)
        .await
        .map_err(ControlError::Internal)?;

    if let Err(e) = coord
        .publish_event(&Event::worker_update(worker_id, WorkerStatus::Offline))
        .await
    {
        tracing::warn!(worker_id = %worker_id, error = %e, "failed to publish worker update");
    }

    Ok(())
}

/// Offline reaper: workers silent past `heartbeat_timeout` go offline in
/// the store and lose their mirror keys. Returns the reaped workers.
pub async fn reap_stale_workers(
    pool: &PgPool,
    coord: &Coordination,
    config: &ControlConfig,
) -> Result<Vec<Worker>> {
    let timeout = chrono::Duration::from_std(config.heartbeat_timeout)
        .unwrap_or_else(|_| chrono::Duration::seconds(90));
    let cutoff = chrono::Utc::now() - timeout;

    let reaped = worker_db::mark_stale_offline(pool, cutoff).await?;

    for worker in &reaped {
        tracing::warn!(
            worker_id = %worker.id,
            machine_name = %worker.machine_name,
            "worker missed heartbeats, marked offline"
        );
        if let Err(e) = coord
            .set_worker_status(worker.id, WorkerStatus::Offline, config.worker_status_ttl())
            .await
        {
            tracing::warn!(worker_id = %worker.id, error = %e, "failed to mirror offline status");
        }
        if let Err(e) = coord.clear_worker_current_task(worker.id).await {
            tracing::warn!(worker_id = %worker.id, error = %e, "failed to clear worker slot");
        }
        if let Err(e) = coord
            .publish_event(&Event::worker_update(worker.id, WorkerStatus::Offline))
            .await
        {
            tracing::warn!(worker_id = %worker.id, error = %e, "failed to publish worker update");
        }
    }

    Ok(reaped)
}

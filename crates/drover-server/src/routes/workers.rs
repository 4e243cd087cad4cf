//! Worker endpoints: registration (open, for bootstrap), heartbeat and
//! unregister (worker-key auth), listings, and API key management.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use drover_core::registry::{self, apikey, ResourceUsage};
use drover_db::models::WorkerStatus;
use drover_db::queries::api_keys as key_db;
use drover_db::queries::workers as worker_db;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub machine_id: String,
    pub machine_name: String,
    #[serde(default)]
    pub system_info: serde_json::Value,
    #[serde(default)]
    pub tools: Vec<String>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let worker = registry::register_worker(
        &state.pool,
        &state.coord,
        &state.config,
        &request.machine_id,
        &request.machine_name,
        &request.system_info,
        &request.tools,
    )
    .await?;

    let status = if worker.last_heartbeat.is_none() {
        "registered"
    } else {
        "updated"
    };

    Ok(Json(serde_json::json!({
        "status": status,
        "worker_id": worker.id,
        "message": format!("Worker {status} successfully"),
    })))
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: WorkerStatus,
    #[serde(default)]
    pub resources: ResourceUsage,
    #[serde(default)]
    pub current_task: Option<Uuid>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, AppError> {
    state.require_worker(&headers, worker_id).await?;

    registry::heartbeat(
        &state.pool,
        &state.coord,
        &state.config,
        worker_id,
        request.status,
        request.resources,
        request.current_task,
    )
    .await?;

    Ok(Json(serde_json::json!({
        "acknowledged": true,
        "message": "Heartbeat received",
    })))
}

pub async fn unregister(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.require_worker(&headers, worker_id).await?;
    registry::unregister_worker(&state.pool, &state.coord, &state.config, worker_id).await?;

    Ok(Json(serde_json::json!({
        "status": "unregistered",
        "worker_id": worker_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, AppError> {
    let limit = params.limit.clamp(1, 100);
    let (workers, total) =
        worker_db::list_workers(&state.pool, params.status, limit, params.offset.max(0)).await?;

    Ok(Json(serde_json::json!({
        "workers": workers,
        "total": total,
        "limit": limit,
        "offset": params.offset.max(0),
    })))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let worker = worker_db::get_worker(&state.pool, worker_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("worker {worker_id} not found")))?;

    Ok(Json(worker))
}

#[derive(Debug, Default, Deserialize)]
pub struct IssueKeyRequest {
    #[serde(default)]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Issue a new API key. The plaintext appears in this response and nowhere
/// else, ever.
pub async fn issue_key(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    request: Option<Json<IssueKeyRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let worker = worker_db::get_worker(&state.pool, worker_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("worker {worker_id} not found")))?;

    let expires_at = request.and_then(|Json(r)| r.expires_at);
    let (row, plaintext) = apikey::issue_key(&state.pool, &state.keys, worker.id, expires_at).await?;

    Ok(Json(serde_json::json!({
        "key_id": row.id,
        "worker_id": row.worker_id,
        "prefix": row.prefix,
        "api_key": plaintext,
        "expires_at": row.expires_at,
        "message": "Store this key now; it is not retrievable later",
    })))
}

pub async fn list_keys(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let keys = key_db::list_for_worker(&state.pool, worker_id).await?;
    Ok(Json(keys))
}

pub async fn revoke_key(
    State(state): State<AppState>,
    Path(key_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let key = key_db::get_api_key(&state.pool, key_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("API key {key_id} not found")))?;

    apikey::revoke_key(&state.pool, key.worker_id, key_id).await?;

    Ok(Json(serde_json::json!({
        "key_id": key_id,
        "revoked": true,
    })))
}

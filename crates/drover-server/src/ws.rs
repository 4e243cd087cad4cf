//! The per-worker push channel (WebSocket).
//!
//! Credentials are validated BEFORE the socket is accepted; at most one
//! channel per worker id is live at a time. The server side subscribes to
//! the worker's coordination channel and forwards every message; inbound
//! traffic is pings, status echoes, and task-complete echoes (the durable
//! result path stays on the idempotent upload endpoint).

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use uuid::Uuid;

use drover_core::coordination::events::{WorkerInbound, WorkerPush};
use drover_core::registry::{self, ResourceUsage};
use drover_db::queries::workers as worker_db;

use crate::error::AppError;
use crate::state::{AppState, WORKER_KEY_HEADER};

/// `GET /api/v1/workers/{id}/ws` -- upgrade to the worker push channel.
///
/// The API key may arrive as the `X-Worker-Key` header or a `key` query
/// parameter (some WebSocket clients cannot set headers).
pub async fn worker_channel(
    State(state): State<AppState>,
    Path(worker_id): Path<Uuid>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let credential = headers
        .get(WORKER_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| params.get("key").cloned())
        .ok_or_else(|| AppError::unauthorized("missing worker API key"))?;

    let authenticated = state.authenticate_credential(&credential).await?;
    if authenticated != worker_id {
        return Err(AppError::forbidden("API key does not match worker ID"));
    }

    worker_db::get_worker(&state.pool, worker_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("worker {worker_id} not found")))?;

    // At most one active channel per worker.
    {
        let mut channels = state.channels.lock();
        if !channels.insert(worker_id) {
            return Err(AppError::conflict(format!(
                "worker {worker_id} already has an open channel"
            )));
        }
    }

    Ok(ws.on_upgrade(move |socket| async move {
        handle_socket(state.clone(), worker_id, socket).await;
        state.channels.lock().remove(&worker_id);
        tracing::info!(worker_id = %worker_id, "worker channel closed");
    }))
}

async fn handle_socket(state: AppState, worker_id: Uuid, socket: WebSocket) {
    tracing::info!(worker_id = %worker_id, "worker channel open");

    let (mut sink, mut stream) = socket.split();
    let mut pushes = state.coord.subscribe_worker_channel(worker_id);

    let connected = WorkerPush::Connected {
        worker_id,
        timestamp: chrono::Utc::now(),
    };
    if send_json(&mut sink, &connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            push = pushes.recv() => {
                match push {
                    Ok(payload) => {
                        if sink.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // At-least-once delivery: a lagged channel drops
                        // pushes here, but assignments are re-derivable
                        // from the store and uploads are idempotent.
                        tracing::warn!(worker_id = %worker_id, missed, "worker channel lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&state, worker_id, &mut sink, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(worker_id = %worker_id, error = %e, "worker channel error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_inbound(
    state: &AppState,
    worker_id: Uuid,
    sink: &mut (impl SinkExt<Message> + Unpin),
    text: &str,
) {
    let message: WorkerInbound = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(worker_id = %worker_id, error = %e, "undecodable worker message");
            return;
        }
    };

    match message {
        WorkerInbound::Ping => {
            let pong = WorkerPush::Pong {
                timestamp: chrono::Utc::now(),
            };
            let _ = send_json(sink, &pong).await;
        }
        WorkerInbound::Status {
            status,
            current_task,
        } => {
            tracing::debug!(worker_id = %worker_id, %status, "worker status over channel");
            if let Err(e) = registry::heartbeat(
                &state.pool,
                &state.coord,
                &state.config,
                worker_id,
                status,
                ResourceUsage::default(),
                current_task,
            )
            .await
            {
                tracing::warn!(worker_id = %worker_id, error = %e, "status echo failed to apply");
            }
        }
        WorkerInbound::TaskComplete {
            subtask_id,
            status,
        } => {
            // Status echo only; the worker still uploads the result via
            // the idempotent endpoint.
            tracing::info!(
                worker_id = %worker_id,
                subtask_id = %subtask_id,
                %status,
                "task completion echoed over channel"
            );
        }
    }
}

async fn send_json(
    sink: &mut (impl SinkExt<Message> + Unpin),
    message: &WorkerPush,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(_) => return Err(()),
    };
    sink.send(Message::Text(payload.into())).await.map_err(|_| ())
}

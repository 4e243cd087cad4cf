//! Shared application state for the HTTP layer.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::HeaderMap;
use parking_lot::Mutex;
use sqlx::PgPool;
use uuid::Uuid;

use drover_core::config::ControlConfig;
use drover_core::coordination::Coordination;
use drover_core::registry::apikey::{self, KeyConfig};

use crate::error::AppError;

/// Header carrying the worker API key.
pub const WORKER_KEY_HEADER: &str = "x-worker-key";

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub coord: Coordination,
    pub config: ControlConfig,
    pub keys: KeyConfig,
    /// Worker ids with an open push channel; at most one per worker.
    pub channels: Arc<Mutex<HashSet<Uuid>>>,
}

impl AppState {
    pub fn new(pool: PgPool, coord: Coordination, config: ControlConfig, keys: KeyConfig) -> Self {
        Self {
            pool,
            coord,
            config,
            keys,
            channels: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Authenticate a worker request from its API key header. Returns the
    /// worker id the key belongs to.
    pub async fn authenticate_worker(&self, headers: &HeaderMap) -> Result<Uuid, AppError> {
        let credential = headers
            .get(WORKER_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing worker API key"))?;

        self.authenticate_credential(credential).await
    }

    /// Authenticate a raw credential string (header or query parameter).
    pub async fn authenticate_credential(&self, credential: &str) -> Result<Uuid, AppError> {
        apikey::authenticate_worker(&self.pool, &self.keys, credential)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| AppError::unauthorized("invalid worker API key"))
    }

    /// Authenticate and require that the key belongs to `worker_id`.
    pub async fn require_worker(
        &self,
        headers: &HeaderMap,
        worker_id: Uuid,
    ) -> Result<(), AppError> {
        let authenticated = self.authenticate_worker(headers).await?;
        if authenticated != worker_id {
            return Err(AppError::forbidden("API key does not match worker ID"));
        }
        Ok(())
    }
}

//! Database query functions for the `worker_api_keys` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::WorkerApiKey;

/// Persist a newly issued key. Only the MAC is stored.
pub async fn insert_api_key(
    pool: &PgPool,
    worker_id: Uuid,
    prefix: &str,
    key_hash: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<WorkerApiKey> {
    let key = sqlx::query_as::<_, WorkerApiKey>(
        "INSERT INTO worker_api_keys (worker_id, prefix, key_hash, expires_at) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(prefix)
    .bind(key_hash)
    .bind(expires_at)
    .fetch_one(pool)
    .await
    .context("failed to insert worker API key")?;

    Ok(key)
}

/// Fetch one key by ID.
pub async fn get_api_key(pool: &PgPool, id: Uuid) -> Result<Option<WorkerApiKey>> {
    let key = sqlx::query_as::<_, WorkerApiKey>("SELECT * FROM worker_api_keys WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch worker API key")?;

    Ok(key)
}

/// All keys sharing a prefix. Prefixes are short, so collisions are
/// possible; the caller verifies the MAC against each candidate.
pub async fn find_by_prefix(pool: &PgPool, prefix: &str) -> Result<Vec<WorkerApiKey>> {
    let keys = sqlx::query_as::<_, WorkerApiKey>(
        "SELECT * FROM worker_api_keys WHERE prefix = $1 ORDER BY created_at DESC",
    )
    .bind(prefix)
    .fetch_all(pool)
    .await
    .context("failed to look up API keys by prefix")?;

    Ok(keys)
}

/// All keys issued for one worker, newest first.
pub async fn list_for_worker(pool: &PgPool, worker_id: Uuid) -> Result<Vec<WorkerApiKey>> {
    let keys = sqlx::query_as::<_, WorkerApiKey>(
        "SELECT * FROM worker_api_keys WHERE worker_id = $1 ORDER BY created_at DESC",
    )
    .bind(worker_id)
    .fetch_all(pool)
    .await
    .context("failed to list API keys for worker")?;

    Ok(keys)
}

/// Revoke a key. Returns rows affected (0 = unknown or already revoked).
pub async fn revoke_api_key(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE worker_api_keys SET revoked_at = NOW() \
         WHERE id = $1 AND revoked_at IS NULL",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to revoke worker API key")?;

    Ok(result.rows_affected())
}

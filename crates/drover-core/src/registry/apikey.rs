//! Worker API key issuance and validation.
//!
//! Keys are HMAC-SHA256 based: the plaintext is random, only its MAC under
//! the server secret is persisted. Format: `drover_wk_<hex>` where the
//! first eight hex characters double as the lookup prefix.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use drover_db::models::WorkerApiKey;
use drover_db::queries::api_keys as key_db;

use crate::error::{ControlError, ControlResult};

type HmacSha256 = Hmac<Sha256>;

/// Prefix identifying drover worker keys.
const KEY_PREFIX: &str = "drover_wk_";

/// Random bytes in each key's plaintext body.
const KEY_BYTES: usize = 24;

/// Length of the lookup prefix taken from the plaintext body.
const LOOKUP_PREFIX_LEN: usize = 8;

/// Errors that can occur during key operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid key format: {0}")]
    InvalidFormat(String),

    #[error("key MAC verification failed")]
    MacMismatch,

    #[error("missing key secret")]
    MissingSecret,
}

/// Configuration for key generation and validation.
#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl KeyConfig {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a KeyConfig from the `DROVER_KEY_SECRET` environment variable.
    ///
    /// The value must be hex-encoded (as written by `drover init`). Returns
    /// an error if the variable is missing or contains invalid hex.
    pub fn from_env() -> Result<Self, KeyError> {
        let secret_hex = std::env::var("DROVER_KEY_SECRET").map_err(|_| KeyError::MissingSecret)?;
        let secret = hex::decode(&secret_hex)
            .map_err(|e| KeyError::InvalidFormat(format!("DROVER_KEY_SECRET is not valid hex: {e}")))?;
        Ok(Self::new(secret))
    }
}

/// A freshly generated key: the plaintext leaves the process exactly once.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub plaintext: String,
    pub prefix: String,
    pub mac_hex: String,
}

/// Generate a new worker key.
pub fn generate_key(config: &KeyConfig) -> GeneratedKey {
    let mut bytes = [0u8; KEY_BYTES];
    rand::rng().fill(&mut bytes);
    let body = hex::encode(bytes);

    let plaintext = format!("{KEY_PREFIX}{body}");
    let prefix = body[..LOOKUP_PREFIX_LEN].to_owned();
    let mac_hex = hex::encode(compute_mac(&config.secret, plaintext.as_bytes()));

    GeneratedKey {
        plaintext,
        prefix,
        mac_hex,
    }
}

/// Extract the lookup prefix from a presented plaintext key.
pub fn lookup_prefix(plaintext: &str) -> Result<&str, KeyError> {
    let body = plaintext
        .strip_prefix(KEY_PREFIX)
        .ok_or_else(|| KeyError::InvalidFormat("key must start with 'drover_wk_'".to_string()))?;

    if body.len() < LOOKUP_PREFIX_LEN {
        return Err(KeyError::InvalidFormat(
            "key too short to contain a prefix".to_string(),
        ));
    }
    Ok(&body[..LOOKUP_PREFIX_LEN])
}

/// Verify a presented plaintext against a stored MAC, in constant time.
pub fn verify_key(
    config: &KeyConfig,
    plaintext: &str,
    stored_mac_hex: &str,
) -> Result<(), KeyError> {
    let expected = hex::decode(stored_mac_hex)
        .map_err(|e| KeyError::InvalidFormat(format!("stored MAC is not valid hex: {e}")))?;

    let mut mac = HmacSha256::new_from_slice(&config.secret).expect("HMAC accepts any key size");
    mac.update(plaintext.as_bytes());
    mac.verify_slice(&expected).map_err(|_| KeyError::MacMismatch)
}

fn compute_mac(secret: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Issue a key for a worker: persist the MAC, return the row and the
/// plaintext. The plaintext is never stored.
pub async fn issue_key(
    pool: &PgPool,
    config: &KeyConfig,
    worker_id: Uuid,
    expires_at: Option<DateTime<Utc>>,
) -> ControlResult<(WorkerApiKey, String)> {
    let generated = generate_key(config);
    let row = key_db::insert_api_key(
        pool,
        worker_id,
        &generated.prefix,
        &generated.mac_hex,
        expires_at,
    )
    .await?;

    tracing::info!(worker_id = %worker_id, key_id = %row.id, "issued worker API key");
    Ok((row, generated.plaintext))
}

/// Authenticate a presented credential: prefix lookup, then constant-time
/// MAC verification against each active candidate. Returns the worker id
/// on success, `None` for any invalid, revoked, or expired key.
pub async fn authenticate_worker(
    pool: &PgPool,
    config: &KeyConfig,
    credential: &str,
) -> anyhow::Result<Option<Uuid>> {
    let prefix = match lookup_prefix(credential) {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };

    let now = Utc::now();
    let candidates = key_db::find_by_prefix(pool, prefix).await?;

    for key in &candidates {
        if !key.is_active(now) {
            continue;
        }
        if verify_key(config, credential, &key.key_hash).is_ok() {
            return Ok(Some(key.worker_id));
        }
    }

    Ok(None)
}

/// Revoke one key by id, scoped to a worker.
pub async fn revoke_key(pool: &PgPool, worker_id: Uuid, key_id: Uuid) -> ControlResult<()> {
    let key = key_db::get_api_key(pool, key_id)
        .await?
        .ok_or_else(|| ControlError::not_found(format!("API key {key_id}")))?;

    if key.worker_id != worker_id {
        return Err(ControlError::invalid(
            "API key does not belong to this worker",
        ));
    }

    let rows = key_db::revoke_api_key(pool, key_id).await?;
    if rows == 0 {
        return Err(ControlError::bad_state(format!(
            "API key {key_id} is already revoked"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> KeyConfig {
        KeyConfig::new(b"test-secret-key-for-drover".to_vec())
    }

    #[test]
    fn generated_key_has_expected_format() {
        let config = test_config();
        let key = generate_key(&config);

        assert!(key.plaintext.starts_with("drover_wk_"));
        // 24 random bytes hex-encoded.
        assert_eq!(key.plaintext.len(), KEY_PREFIX.len() + KEY_BYTES * 2);
        assert_eq!(key.prefix.len(), LOOKUP_PREFIX_LEN);
        assert!(key.plaintext.contains(&key.prefix));
        // HMAC-SHA256 = 32 bytes = 64 hex chars.
        assert_eq!(key.mac_hex.len(), 64);
    }

    #[test]
    fn generate_and_verify_roundtrip() {
        let config = test_config();
        let key = generate_key(&config);

        verify_key(&config, &key.plaintext, &key.mac_hex).expect("fresh key must verify");
    }

    #[test]
    fn lookup_prefix_matches_generated() {
        let config = test_config();
        let key = generate_key(&config);
        assert_eq!(lookup_prefix(&key.plaintext).unwrap(), key.prefix);
    }

    #[test]
    fn reject_tampered_key() {
        let config = test_config();
        let key = generate_key(&config);

        let mut tampered = key.plaintext.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'a' { 'b' } else { 'a' });

        let result = verify_key(&config, &tampered, &key.mac_hex);
        assert!(matches!(result.unwrap_err(), KeyError::MacMismatch));
    }

    #[test]
    fn reject_wrong_secret() {
        let config = test_config();
        let key = generate_key(&config);

        let other = KeyConfig::new(b"a-different-secret".to_vec());
        let result = verify_key(&other, &key.plaintext, &key.mac_hex);
        assert!(matches!(result.unwrap_err(), KeyError::MacMismatch));
    }

    #[test]
    fn reject_wrong_prefix() {
        assert!(matches!(
            lookup_prefix("sk-ant-whatever").unwrap_err(),
            KeyError::InvalidFormat(_)
        ));
    }

    #[test]
    fn reject_truncated_key() {
        assert!(matches!(
            lookup_prefix("drover_wk_ab").unwrap_err(),
            KeyError::InvalidFormat(_)
        ));
    }

    #[test]
    fn reject_garbage_stored_mac() {
        let config = test_config();
        let key = generate_key(&config);
        let result = verify_key(&config, &key.plaintext, "zz-not-hex");
        assert!(matches!(result.unwrap_err(), KeyError::InvalidFormat(_)));
    }

    #[test]
    fn distinct_keys_are_generated() {
        let config = test_config();
        let a = generate_key(&config);
        let b = generate_key(&config);
        assert_ne!(a.plaintext, b.plaintext);
        assert_ne!(a.mac_hex, b.mac_hex);
    }

    #[test]
    fn key_config_from_env_missing() {
        // SAFETY: test-only; env var manipulation is safe in single-threaded tests.
        unsafe { std::env::remove_var("DROVER_KEY_SECRET") };
        let result = KeyConfig::from_env();
        assert!(matches!(result.unwrap_err(), KeyError::MissingSecret));
    }
}

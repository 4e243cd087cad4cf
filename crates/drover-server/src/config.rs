//! Configuration file management for drover.
//!
//! Provides a TOML-based config file at `~/.config/drover/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use drover_core::registry::apikey::KeyConfig;
use drover_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded worker-key secret (64 hex chars = 32 bytes).
    pub key_secret: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the drover config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/drover` or `~/.config/drover`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("drover");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("drover")
}

/// Return the path to the drover config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Secret generation
// -----------------------------------------------------------------------

/// Generate a random worker-key secret: 32 random bytes, hex-encoded.
pub fn generate_key_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ServerConfig {
    pub db_config: DbConfig,
    pub key_config: KeyConfig,
}

impl ServerConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default. The worker-key secret has no default: it must come
    /// from the env or the config file.
    pub fn resolve(database_url: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let db_url = database_url
            .map(str::to_owned)
            .or_else(|| std::env::var("DROVER_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_owned());

        let secret_hex = std::env::var("DROVER_KEY_SECRET")
            .ok()
            .or_else(|| file.as_ref().map(|f| f.auth.key_secret.clone()))
            .context(
                "no worker-key secret found; run `drover init` or set DROVER_KEY_SECRET",
            )?;
        let secret = hex::decode(&secret_hex).context("worker-key secret is not valid hex")?;

        Ok(Self {
            db_config: DbConfig::new(db_url),
            key_config: KeyConfig::new(secret),
        })
    }
}

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

// ---------------------------------------------------------------------------
// Runtime configuration
// ---------------------------------------------------------------------------

/// Configuration served by the backend's runtime-config endpoint.
///
/// Fetched once at startup; all later reads come from the process-wide cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Base URL for request/response APIs.
    pub api_base_url: String,
    /// URL of the task-room socket endpoint.
    pub socket_url: String,
    /// Whether the correction side-panel is available for this deployment.
    pub enable_correction: bool,
    /// Whether group-chat features are available.
    pub enable_group_chat: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_base_url: "/api".to_string(),
            socket_url: String::new(),
            enable_correction: true,
            enable_group_chat: true,
        }
    }
}

static RUNTIME_CONFIG: OnceCell<RuntimeConfig> = OnceCell::new();

/// Fetch the runtime configuration from the given endpoint and cache it.
///
/// A second call returns the cached value without touching the network.
pub async fn fetch_runtime_config(config_url: &str) -> Result<&'static RuntimeConfig> {
    if let Some(config) = RUNTIME_CONFIG.get() {
        return Ok(config);
    }

    let response = reqwest::get(config_url)
        .await
        .with_context(|| format!("Failed to fetch runtime config from {config_url}"))?;
    let config: RuntimeConfig = response
        .json()
        .await
        .context("Failed to parse runtime config")?;

    info!("Runtime config loaded: api_base_url={}", config.api_base_url);
    Ok(RUNTIME_CONFIG.get_or_init(|| config))
}

/// The cached runtime configuration, if [`fetch_runtime_config`] has run.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

/// Install a configuration directly, bypassing the network (tests, embedding).
pub fn set_runtime_config(config: RuntimeConfig) -> &'static RuntimeConfig {
    RUNTIME_CONFIG.get_or_init(|| config)
}

// ---------------------------------------------------------------------------
// Local directories
// ---------------------------------------------------------------------------

/// Resolves the local directories the client writes to.
pub struct WegentDirs;

impl WegentDirs {
    /// Base directory for all local state: `~/.wegent`.
    pub fn base_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".wegent"))
    }

    /// Directory for rotated log files: `~/.wegent/logs`.
    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("logs"))
    }

    /// Path of the local key-value database: `~/.wegent/state.db`.
    pub fn db_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("state.db"))
    }

    /// Path of the encrypted bearer-token file: `~/.wegent/token.enc`.
    pub fn token_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("token.enc"))
    }

    /// Path of the key-derivation salt: `~/.wegent/storage.salt`.
    pub fn salt_path() -> Result<PathBuf> {
        Ok(Self::base_dir()?.join("storage.salt"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_api_base() {
        let config = RuntimeConfig::default();
        assert_eq!(config.api_base_url, "/api");
        assert!(config.enable_correction);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{ "api_base_url": "https://wegent.example/api" }"#).unwrap();
        assert_eq!(config.api_base_url, "https://wegent.example/api");
        assert!(config.socket_url.is_empty());
        assert!(config.enable_group_chat);
    }

    #[test]
    fn dirs_are_rooted_under_wegent() {
        let base = WegentDirs::base_dir().unwrap();
        assert!(base.ends_with(".wegent"));
        assert!(WegentDirs::db_path().unwrap().starts_with(&base));
        assert!(WegentDirs::token_path().unwrap().starts_with(&base));
    }
}

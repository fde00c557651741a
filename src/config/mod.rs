//! Configuration Management
//!
//! # Configuration Locations
//! - Local: `.querygate/config.json` (per-project)
//! - Global: `<config_dir>/querygate/config.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Explicit CLI flags (highest priority)
//! 2. Environment (`QUERYGATE_ENCRYPT_KEY`, `QUERYGATE_STORE`,
//!    `QUERYGATE_STATEMENT_TIMEOUT_MS`)
//! 3. Local config file
//! 4. Global config file
//! 5. Built-in defaults
//!
//! There is no default encryption key. A missing key only fails when a vault
//! is requested, so commands that never touch credentials still run.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::ExecutionLimits;
use crate::error::{QueryGateError, Result};
use crate::vault::CredentialVault;

pub const ENV_ENCRYPT_KEY: &str = "QUERYGATE_ENCRYPT_KEY";
pub const ENV_STORE: &str = "QUERYGATE_STORE";
pub const ENV_STATEMENT_TIMEOUT_MS: &str = "QUERYGATE_STATEMENT_TIMEOUT_MS";

pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_ROWS: usize = 1000;
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Fully resolved application settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base64-encoded 32-byte vault key
    pub encryption_key: Option<String>,
    pub statement_timeout_ms: u64,
    pub max_rows: usize,
    pub store_path: PathBuf,
    pub log_level: String,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("statement_timeout_ms", &self.statement_timeout_ms)
            .field("max_rows", &self.max_rows)
            .field("store_path", &self.store_path)
            .field("log_level", &self.log_level)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            encryption_key: None,
            statement_timeout_ms: DEFAULT_STATEMENT_TIMEOUT_MS,
            max_rows: DEFAULT_MAX_ROWS,
            store_path: default_store_path(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// One configuration layer; unset fields defer to lower layers
///
/// This is also the on-disk format of both config files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl ConfigLayer {
    /// Read the environment layer through `lookup`
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let statement_timeout_ms = match lookup(ENV_STATEMENT_TIMEOUT_MS) {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
                QueryGateError::config_error(format!(
                    "{ENV_STATEMENT_TIMEOUT_MS} must be a number of milliseconds, got '{raw}'"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            encryption_key: lookup(ENV_ENCRYPT_KEY).filter(|k| !k.trim().is_empty()),
            statement_timeout_ms,
            max_rows: None,
            store_path: lookup(ENV_STORE).filter(|p| !p.is_empty()).map(PathBuf::from),
            log_level: None,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    fn apply_to(self, config: &mut AppConfig) {
        if let Some(key) = self.encryption_key {
            config.encryption_key = Some(key);
        }
        if let Some(timeout) = self.statement_timeout_ms {
            config.statement_timeout_ms = timeout;
        }
        if let Some(max_rows) = self.max_rows {
            config.max_rows = max_rows;
        }
        if let Some(path) = self.store_path {
            config.store_path = path;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

impl AppConfig {
    /// Merge layers from lowest to highest precedence over the defaults
    #[must_use]
    pub fn from_layers(layers: impl IntoIterator<Item = ConfigLayer>) -> Self {
        let mut config = Self::default();
        for layer in layers {
            layer.apply_to(&mut config);
        }
        config
    }

    /// Resolve configuration from files, environment and CLI overrides
    pub fn load(cli: ConfigLayer) -> Result<Self> {
        let global = load_layer(&global_config_path()?)?;
        let local = load_layer(&local_config_path()?)?;
        let env = ConfigLayer::from_env()?;

        let config = Self::from_layers([global, local, env, cli]);
        tracing::debug!(?config, "configuration resolved");
        Ok(config)
    }

    /// Build the credential vault from the configured key
    pub fn vault(&self) -> Result<CredentialVault> {
        let key = self.encryption_key.as_deref().ok_or_else(|| {
            QueryGateError::config_error(format!(
                "No encryption key configured. Set {ENV_ENCRYPT_KEY} or run 'querygate keygen --save'"
            ))
        })?;
        CredentialVault::from_base64_key(key)
    }

    #[must_use]
    pub const fn limits(&self) -> ExecutionLimits {
        ExecutionLimits::new(Some(self.max_rows), Some(self.statement_timeout_ms))
    }
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from(".querygate"), |dir| dir.join("querygate"))
        .join("store.json")
}

/// Get path to local config file (`.querygate/config.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        QueryGateError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".querygate").join("config.json"))
}

/// Get path to global config file (`<config_dir>/querygate/config.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| QueryGateError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("querygate").join("config.json"))
}

/// Load one config file; a missing file is an empty layer
pub fn load_layer(path: &Path) -> Result<ConfigLayer> {
    if !path.exists() {
        return Ok(ConfigLayer::default());
    }

    let contents = fs::read_to_string(path)
        .map_err(|e| QueryGateError::config_error(format!("Could not read config file: {e}")))?;

    serde_json::from_str(&contents).map_err(|e| {
        QueryGateError::config_error(format!("Invalid config file '{}': {e}", path.display()))
    })
}

/// Write a config file, creating its directory if needed
pub fn save_layer(path: &Path, layer: &ConfigLayer) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            QueryGateError::config_error(format!("Could not create config directory: {e}"))
        })?;
    }

    let contents = serde_json::to_string_pretty(layer)
        .map_err(|e| QueryGateError::config_error(format!("Could not serialize config: {e}")))?;

    fs::write(path, contents)
        .map_err(|e| QueryGateError::config_error(format!("Could not write config file: {e}")))
}

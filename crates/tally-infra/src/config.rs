//! Configuration loader for Tally.
//!
//! Reads `config.toml` (from `--config` or the data directory) into
//! [`TallyConfig`], falling back to defaults when the file is missing or
//! malformed, then applies environment overrides. Secrets are read from the
//! environment only and kept in [`SecretString`]s.

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use tally_types::config::TallyConfig;

pub const ENV_DATA_DIR: &str = "TALLY_DATA_DIR";
pub const ENV_DATABASE_URL: &str = "TALLY_DATABASE_URL";
pub const ENV_GATEWAY_URL: &str = "TALLY_GATEWAY_URL";
pub const ENV_GATEWAY_SHARED_SECRET: &str = "TALLY_GATEWAY_SHARED_SECRET";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";

/// `$TALLY_DATA_DIR`, else `~/.tally`, else `./.tally`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tally")
}

/// Load configuration from `path`, or `{data_dir}/config.toml` when `path` is
/// `None`.
///
/// - If the file does not exist, returns [`TallyConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and
///   returns the default.
pub async fn load_config(path: Option<&Path>, data_dir: &Path) -> TallyConfig {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(|| data_dir.join("config.toml"));

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return TallyConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return TallyConfig::default();
        }
    };

    match toml::from_str::<TallyConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            TallyConfig::default()
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Apply URL overrides from `lookup` (normally `std::env::var`).
pub fn apply_env_overrides(config: &mut TallyConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(url) = non_empty(lookup(ENV_DATABASE_URL)) {
        config.server.database_url = Some(url);
    }
    if let Some(url) = non_empty(lookup(ENV_GATEWAY_URL)) {
        config.chat.gateway_url = url;
    }
    if let Some(url) = non_empty(lookup(ENV_OPENAI_BASE_URL)) {
        config.provider.base_url = url;
    }
}

/// Process environment as a lookup function.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Credentials read from the environment.
pub struct Secrets {
    pub gateway_shared_secret: Option<SecretString>,
    pub provider_api_key: Option<SecretString>,
}

impl Secrets {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            gateway_shared_secret: non_empty(lookup(ENV_GATEWAY_SHARED_SECRET)).map(SecretString::from),
            provider_api_key: non_empty(lookup(ENV_OPENAI_API_KEY)).map(SecretString::from),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(process_env)
    }

    /// Both servers refuse to start without a shared secret.
    pub fn require_shared_secret(&self) -> Result<SecretString, ConfigError> {
        self.gateway_shared_secret
            .clone()
            .ok_or(ConfigError::MissingSecret(ENV_GATEWAY_SHARED_SECRET))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set to a non-empty value")]
    MissingSecret(&'static str),
}

//! Configuration loading for the order bridge.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `POLLER_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `POLLER_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Base64-encoded 32-byte symmetric key for credential encryption.
    /// Redacted from any serialized representation.
    #[serde(skip_serializing)]
    pub encryption_key: String,
    #[serde(default)]
    pub default_webhook_url: String,
}

impl AppConfig {
    /// Returns a redacted JSON representation safe for startup logging.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn default_db_path() -> String {
    "data/poller.db".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error(
        "POLLER_ENCRYPTION_KEY is required (base64-encoded 32-byte key); \
         generate one with: head -c 32 /dev/urandom | base64"
    )]
    MissingEncryptionKey,
}

/// Loads configuration using layered `.env` files and `POLLER_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration, failing fast when the encryption key is absent.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut layered = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("POLLER_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let encryption_key = layered
            .remove("ENCRYPTION_KEY")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::MissingEncryptionKey)?;

        let db_path = layered
            .remove("DB_PATH")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_db_path);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let default_webhook_url = layered.remove("DEFAULT_WEBHOOK_URL").unwrap_or_default();

        Ok(AppConfig {
            db_path,
            log_level,
            log_format,
            encryption_key,
            default_webhook_url,
        })
    }

    fn collect_layered_env(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        Ok(values)
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("POLLER_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

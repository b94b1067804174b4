//! Manager and client configuration.
//!
//! The manager reads a single JSON file, by default
//! `<config>/blobxfer/config.json`. Every field is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use blobxfer_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CONCURRENCY};

use crate::policy::{RetryPolicy, TransferNetworkPolicy};
use crate::store::{config_dir, default_store_dir};

/// Errors from reading or writing the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Process-wide manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManagerConfig {
    /// Chunk operations in flight across all transfers.
    pub max_concurrency: usize,
    /// Chunk size for transfers whose client sets no smaller limit.
    pub chunk_size: u64,
    pub retry: RetryPolicy,
    /// How long a disallowed network must persist before active
    /// transfers are paused, in milliseconds.
    pub network_pause_grace_ms: u64,
    /// Directory of persisted transfer records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry: RetryPolicy::default(),
            network_pause_grace_ms: 0,
            store_dir: None,
        }
    }
}

impl ManagerConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields the defaults; so does a file that fails to
    /// parse, with a warning.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn network_pause_grace(&self) -> Duration {
        Duration::from_millis(self.network_pause_grace_ms)
    }

    /// The configured record directory, or the platform default.
    pub fn resolved_store_dir(&self) -> Option<PathBuf> {
        self.store_dir.clone().or_else(default_store_dir)
    }
}

/// Returns the default config file path.
pub fn default_config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("blobxfer").join("config.json"))
}

/// Per-client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientOptions {
    /// Owner tag stamped on every transfer the client creates. A persisted
    /// transfer can only be resumed while a client with the same id is
    /// registered.
    pub restoration_id: String,
    /// Upper bound on the chunk size of this client's transfers.
    pub max_chunk_size: u64,
    pub download_policy: TransferNetworkPolicy,
    pub upload_policy: TransferNetworkPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            restoration_id: "blobxfer".into(),
            max_chunk_size: DEFAULT_CHUNK_SIZE,
            download_policy: TransferNetworkPolicy::default(),
            upload_policy: TransferNetworkPolicy::default(),
        }
    }
}

impl ClientOptions {
    pub fn new(restoration_id: impl Into<String>) -> Self {
        Self {
            restoration_id: restoration_id.into(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.network_pause_grace(), Duration::ZERO);
        assert!(config.store_dir.is_none());
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ManagerConfig::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, ManagerConfig::default());
    }

    #[test]
    fn load_invalid_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert_eq!(ManagerConfig::load(&path).unwrap(), ManagerConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"maxConcurrency": 8, "retry": {"maxAttempts": 2}, "storeDir": "/var/lib/x"}"#,
        )
        .unwrap();
        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.max_delay_ms, 15_000);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.resolved_store_dir(), Some(PathBuf::from("/var/lib/x")));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = ManagerConfig {
            network_pause_grace_ms: 1500,
            ..ManagerConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(ManagerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn client_options_new() {
        let options = ClientOptions::new("demo.app");
        assert_eq!(options.restoration_id, "demo.app");
        assert_eq!(options.max_chunk_size, DEFAULT_CHUNK_SIZE);
    }
}

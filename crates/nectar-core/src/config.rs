//! Engine configuration with JSON persistence
//!
//! Settings load from a JSON file and merge over the defaults, so a config
//! written by an older version keeps working when fields are added. A
//! missing file is created with the defaults on first load.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::EngineResult;

/// Tunables for the torrent engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for per-session drive namespaces
    pub data_dir: PathBuf,
    /// Default destination root for downloads
    pub download_dir: PathBuf,
    /// Bounded wait for the first peer connection on a download
    pub peer_wait_timeout_ms: u64,
    /// How many times to poll for the metadata record before giving up on it
    pub metadata_retries: u32,
    /// Delay between metadata record polls
    pub metadata_retry_interval_ms: u64,
    /// Delay between file-enumeration polls (retried while the session lives)
    pub enumeration_retry_interval_ms: u64,
    /// Interval of the remote-update poll on steady downloads
    pub remote_poll_interval_ms: u64,
    /// Grace period for in-flight streams to observe cancellation on remove
    pub remove_grace_ms: u64,
    /// Capacity of the snapshot broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./nectar-data"),
            download_dir: PathBuf::from("./downloads"),
            peer_wait_timeout_ms: 60_000,
            metadata_retries: 10,
            metadata_retry_interval_ms: 2_000,
            enumeration_retry_interval_ms: 2_000,
            remote_poll_interval_ms: 5_000,
            remove_grace_ms: 200,
            event_channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `path`, writing the defaults there first if
    /// the file does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            info!(?path, "Created default config");
            return Ok(config);
        }

        let data = fs::read_to_string(path)?;
        match serde_json::from_str(&data) {
            Ok(config) => {
                info!(?path, "Loaded config");
                Ok(config)
            }
            Err(err) => {
                warn!(?path, %err, "Config unreadable, falling back to defaults");
                Ok(Self::default())
            }
        }
    }

    /// Persist configuration as pretty-printed JSON, creating parent
    /// directories as needed.
    pub fn save(&self, path: impl AsRef<Path>) -> EngineResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn peer_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_wait_timeout_ms)
    }

    pub fn metadata_retry_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_retry_interval_ms)
    }

    pub fn enumeration_retry_interval(&self) -> Duration {
        Duration::from_millis(self.enumeration_retry_interval_ms)
    }

    pub fn remote_poll_interval(&self) -> Duration {
        Duration::from_millis(self.remote_poll_interval_ms)
    }

    pub fn remove_grace(&self) -> Duration {
        Duration::from_millis(self.remove_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.peer_wait_timeout(), Duration::from_secs(60));
        assert_eq!(config.metadata_retries, 10);
        assert_eq!(config.event_channel_capacity, 256);
    }

    #[test]
    fn test_missing_file_creates_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(path.exists());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = EngineConfig::default();
        config.remote_poll_interval_ms = 1234;
        config.download_dir = PathBuf::from("/tmp/elsewhere");
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"peer_wait_timeout_ms": 500}"#).unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.peer_wait_timeout_ms, 500);
        assert_eq!(config.metadata_retries, EngineConfig::default().metadata_retries);
    }
}

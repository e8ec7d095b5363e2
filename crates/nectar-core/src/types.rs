//! Core types for the Nectar engine

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::EngineError;

/// Logical path of the metadata record inside every seeded drive
pub const METADATA_PATH: &str = "/.metadata.json";

/// Fixed logical path used when a single file is seeded
pub const SINGLE_FILE_PATH: &str = "/file";

/// Public identifier of a content drive (32 bytes, hex-encoded on the wire)
///
/// A torrent key doubles as the handle peers exchange to fetch content and
/// as the seed of the discovery topic they meet on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TorrentKey(pub [u8; 32]);

impl TorrentKey {
    /// Generate a new random key (a fresh drive identity)
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the key
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, EngineError> {
        let bytes = hex::decode(s).map_err(|e| EngineError::InvalidKey(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::InvalidKey(format!("expected 32 bytes, got {}", s.len() / 2)))?;
        Ok(Self(arr))
    }

    /// Hex encoding for display and the wire
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First six hex characters, used for fallback display names
    pub fn short(&self) -> String {
        hex::encode(&self.0[..3])
    }

    /// The discovery topic peers join to replicate this drive
    pub fn discovery_topic(&self) -> DiscoveryTopic {
        DiscoveryTopic(self.0)
    }
}

impl std::fmt::Display for TorrentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "torrent_{}", self.short())
    }
}

impl Serialize for TorrentKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TorrentKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TorrentKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifier of a discovery topic derived from a drive's identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryTopic(pub [u8; 32]);

/// Whether a session publishes local content or fetches remote content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Seed,
    Download,
}

/// Lifecycle state of a session
///
/// Seed sessions move `SeedingInit -> {Seeding, SeedingDir}`. Download
/// sessions move `DownloadInit -> MetadataFetching -> MetadataReady ->
/// {Downloading, DownloadingDir} -> Steady`. `Syncing` is a transient
/// sub-state entered from a steady state while a resync transfer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    SeedingInit,
    Seeding,
    SeedingDir,
    DownloadInit,
    MetadataFetching,
    MetadataReady,
    Downloading,
    DownloadingDir,
    Steady,
    Syncing,
}

impl SessionState {
    /// States from which a resync may start
    pub fn is_steady(&self) -> bool {
        matches!(
            self,
            SessionState::Seeding | SessionState::SeedingDir | SessionState::Steady
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::SeedingInit => "seeding-init",
            SessionState::Seeding => "seeding",
            SessionState::SeedingDir => "seeding-dir",
            SessionState::DownloadInit => "download-init",
            SessionState::MetadataFetching => "metadata-fetching",
            SessionState::MetadataReady => "metadata-ready",
            SessionState::Downloading => "downloading",
            SessionState::DownloadingDir => "downloading-dir",
            SessionState::Steady => "steady",
            SessionState::Syncing => "syncing",
        };
        write!(f, "{}", s)
    }
}

/// One file known to exist in a drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Logical path inside the drive, with a leading slash
    pub path: String,
    /// Size in bytes
    pub size: u64,
}

/// What kind of source backed a seed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Directory,
}

/// Metadata record written at [`METADATA_PATH`] before any payload bytes,
/// so a partially transferred seed is still identifiable by peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveMetadata {
    /// Logical display name chosen by the seeder
    pub name: String,
    /// File or directory seed
    pub source_kind: SourceKind,
    /// Basename of the source path on the seeder's machine
    pub source_name: String,
    /// RFC 3339 creation timestamp
    pub created_at: String,
    /// RFC 3339 timestamp of the last reseed, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl DriveMetadata {
    pub fn to_bytes(&self) -> Result<bytes::Bytes, EngineError> {
        Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EngineError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Externally visible snapshot of one session
///
/// Snapshots are immutable values; the full snapshot list is rebuilt and
/// re-broadcast on every observable change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TorrentSnapshot {
    pub key: TorrentKey,
    pub name: String,
    pub size: u64,
    pub state: SessionState,
    pub peers: usize,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub file_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
    pub has_local_changes: bool,
    pub has_remote_update: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_version: Option<u64>,
    pub applied_version: u64,
}

/// Integer percentage of `done` over `total`, clamped to 0-100.
///
/// An empty transfer (zero total bytes) is complete by definition.
pub fn transfer_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done as f64 / total as f64 * 100.0).floor() as u64;
    pct.min(100) as u8
}

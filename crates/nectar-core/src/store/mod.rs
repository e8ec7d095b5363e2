//! Adapter traits for the replicated content store and discovery transport
//!
//! The engine never talks to a concrete replication library. It consumes a
//! versioned hierarchical drive per torrent key, an isolated namespace per
//! session, and a discovery swarm, all behind object-safe async traits.
//! [`memory`] provides the in-process reference implementation used by the
//! test suite; a production adapter binds these traits to a real
//! DHT-backed replication stack.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::error::EngineResult;
use crate::types::{DiscoveryTopic, FileEntry, TorrentKey};

pub mod memory;

/// Boxed chunk-readable stream over one drive file
pub type DriveReader = Pin<Box<dyn AsyncRead + Send>>;

/// Boxed writable stream into one drive file
///
/// Written bytes become durable, and the drive version advances, when the
/// writer is shut down. Dropping a writer without shutdown discards it.
pub type DriveWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Factory for isolated storage namespaces
#[async_trait]
pub trait StoreProvider: Send + Sync {
    /// Open (creating if needed) the namespace with the given id, rooted
    /// under the provider's configured data directory. The returned handle
    /// is ready for use.
    async fn open_namespace(&self, id: &str) -> EngineResult<Arc<dyn Namespace>>;
}

/// An isolated storage sub-scope owned by exactly one session
#[async_trait]
pub trait Namespace: Send + Sync {
    /// Create a drive with a fresh identity inside this namespace
    async fn create_drive(&self) -> EngineResult<Arc<dyn Drive>>;

    /// Open the drive with a known public key inside this namespace
    async fn open_drive(&self, key: &TorrentKey) -> EngineResult<Arc<dyn Drive>>;

    /// Release the namespace. Fails if drive handles are still open; such
    /// failures are cleanup warnings, not fatal.
    async fn close(&self) -> EngineResult<()>;
}

/// A versioned, hierarchical, replicated key->bytes store
#[async_trait]
pub trait Drive: Send + Sync {
    /// Stable public identity of this drive
    fn key(&self) -> TorrentKey;

    /// Monotonically increasing version reflecting applied local and
    /// replicated operations
    async fn version(&self) -> u64;

    /// Pull the latest replicated state from connected peers
    async fn refresh(&self) -> EngineResult<()>;

    /// Durably write a whole file at `path`
    async fn put(&self, path: &str, bytes: Bytes) -> EngineResult<()>;

    /// Read a whole file, or `None` if no entry exists at `path`
    async fn get(&self, path: &str) -> EngineResult<Option<Bytes>>;

    /// Delete the entry at `path` (no-op if absent)
    async fn del(&self, path: &str) -> EngineResult<()>;

    /// Enumerate entries, optionally under a path prefix. The listing is a
    /// finite snapshot; re-list for a fresh view.
    async fn list(&self, prefix: Option<&str>) -> EngineResult<Vec<FileEntry>>;

    /// Open a chunked reader over the file at `path`
    async fn read_stream(&self, path: &str) -> EngineResult<DriveReader>;

    /// Open a writer that commits the file at `path` on shutdown
    async fn write_stream(&self, path: &str) -> EngineResult<DriveWriter>;

    /// Watch the number of remote peers replicating this drive
    fn peer_count(&self) -> watch::Receiver<usize>;

    /// Close this handle
    async fn close(&self) -> EngineResult<()>;
}

/// How to participate in a discovery topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinMode {
    /// Announce ourselves so others can find us
    pub server: bool,
    /// Look up others announcing on the topic
    pub client: bool,
}

impl JoinMode {
    /// Announce and look up, the mode both seeders and downloaders use
    pub fn server_and_client() -> Self {
        Self {
            server: true,
            client: true,
        }
    }
}

/// Discovery transport: finds peers for a topic and replicates drives over
/// the established connections
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Join a discovery topic. Replication to peers found on the topic is
    /// the transport's responsibility; the engine only holds the handle.
    async fn join(&self, topic: DiscoveryTopic, mode: JoinMode) -> EngineResult<Box<dyn Discovery>>;
}

/// Live membership in one discovery topic
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Leave the topic and stop advertising
    async fn destroy(&self) -> EngineResult<()>;
}

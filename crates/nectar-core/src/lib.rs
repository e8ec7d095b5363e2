//! Nectar Core Library
//!
//! P2P file sharing over a replicated, content-addressed drive: publish a
//! file or directory tree and share its public key; other peers fetch it
//! by key with live progress, cancellation, selective downloads, and
//! size-based incremental resync.
//!
//! ## Overview
//!
//! The heart of the crate is the [`TorrentEngine`], which tracks one
//! session per torrent key and drives each through its lifecycle:
//! announce, metadata exchange, file selection, data transfer, steady
//! state, and resync. The replicated store and the discovery transport
//! are external collaborators consumed through the traits in [`store`];
//! [`store::memory`] provides an in-process implementation used by the
//! test suite.
//!
//! ## Quick Start
//!
//! ```ignore
//! use nectar_core::{EngineConfig, TorrentEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = TorrentEngine::new(EngineConfig::default(), provider, swarm);
//!
//!     // Publish a directory and hand the key to peers
//!     let key = engine.seed("./photos", None).await?;
//!     println!("share: {}", key.to_hex());
//!
//!     // Elsewhere: fetch by key
//!     let session = engine.download(key, None).await?;
//!     // ... wait for metadata-ready on the snapshot stream ...
//!     engine.confirm_download(key, None).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
mod session;
pub mod store;
pub mod types;
pub mod walk;

// Re-exports
pub use config::EngineConfig;
pub use engine::{compute_diff, TorrentEngine};
pub use error::{EngineError, EngineResult};
pub use store::{Discovery, Drive, DriveReader, DriveWriter, JoinMode, Namespace, StoreProvider, Swarm};
pub use types::{
    transfer_percent, DiscoveryTopic, DriveMetadata, FileEntry, SessionRole, SessionState,
    SourceKind, TorrentKey, TorrentSnapshot, METADATA_PATH, SINGLE_FILE_PATH,
};
pub use walk::{walk_dir, WalkedFile};

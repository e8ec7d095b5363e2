//! Torrent session lifecycle manager
//!
//! The `TorrentEngine` owns the session registry (one live session per
//! torrent key) and drives every session through its state machine:
//! announce, metadata exchange, file selection, data transfer, steady
//! state, and resync. All mutation goes through the engine; observers
//! receive the full snapshot list over a broadcast channel on every
//! observable change.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  TorrentEngine                                               │
//! │  ├── sessions: RwLock<HashMap<TorrentKey, Arc<Session>>>     │
//! │  │   └── registry, single source of truth for "active now"   │
//! │  ├── provider / swarm: Arc<dyn ...>                          │
//! │  │   └── content store + discovery adapters                  │
//! │  └── event_tx: broadcast::Sender<Vec<TorrentSnapshot>>       │
//! │      └── full snapshot list on every change                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod monitor;
mod resync;
mod transfer;

pub use resync::compute_diff;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::session::Session;
use crate::store::{JoinMode, StoreProvider, Swarm};
use crate::types::{
    FileEntry, SessionRole, SessionState, SourceKind, TorrentKey, TorrentSnapshot,
};

pub(crate) struct Inner {
    pub(crate) config: EngineConfig,
    pub(crate) provider: Arc<dyn StoreProvider>,
    pub(crate) swarm: Arc<dyn Swarm>,
    pub(crate) sessions: RwLock<HashMap<TorrentKey, Arc<Session>>>,
    pub(crate) event_tx: broadcast::Sender<Vec<TorrentSnapshot>>,
}

/// Manager for all seed and download sessions
///
/// Cheap to clone; clones share the registry and event stream.
///
/// # Example
///
/// ```ignore
/// use nectar_core::{EngineConfig, TorrentEngine};
///
/// let engine = TorrentEngine::new(EngineConfig::default(), provider, swarm);
/// let key = engine.seed("./photos", None).await?;
/// println!("share this key: {}", key.to_hex());
/// ```
#[derive(Clone)]
pub struct TorrentEngine {
    inner: Arc<Inner>,
}

impl TorrentEngine {
    /// Create an engine over the given store and discovery adapters
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn StoreProvider>,
        swarm: Arc<dyn Swarm>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                provider,
                swarm,
                sessions: RwLock::new(HashMap::new()),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Subscribe to the snapshot stream. Every observable change delivers
    /// the full, freshly rebuilt snapshot list.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<TorrentSnapshot>> {
        self.inner.event_tx.subscribe()
    }

    /// Snapshot every registered session, ordered by key
    pub async fn get_all_sessions(&self) -> Vec<TorrentSnapshot> {
        self.inner.snapshots().await
    }

    /// Publish a file or directory tree and return its torrent key.
    ///
    /// The returned key is what other peers pass to [`download`]. The call
    /// resolves once the content is fully written to the drive and the
    /// drive is announced on its discovery topic; progress is observable
    /// on the snapshot stream meanwhile.
    ///
    /// [`download`]: TorrentEngine::download
    pub async fn seed(
        &self,
        path: impl AsRef<Path>,
        name: Option<String>,
    ) -> EngineResult<TorrentKey> {
        self.inner.clone().seed(path.as_ref(), name).await
    }

    /// Start fetching the drive behind `key`. Idempotent: a key that is
    /// already registered returns its existing session.
    ///
    /// The session appears in `metadata-fetching`; once a peer is found
    /// and the enumeration replicates it moves to `metadata-ready`, at
    /// which point [`confirm_download`] starts the actual transfer.
    ///
    /// [`confirm_download`]: TorrentEngine::confirm_download
    pub async fn download(
        &self,
        key: TorrentKey,
        save_dir: Option<PathBuf>,
    ) -> EngineResult<TorrentSnapshot> {
        self.inner.clone().download(key, save_dir).await
    }

    /// Confirm a download in `metadata-ready`, optionally restricting it
    /// to a subset of the enumerated files (`None` means all).
    pub async fn confirm_download(
        &self,
        key: TorrentKey,
        selected: Option<Vec<String>>,
    ) -> EngineResult<()> {
        self.inner.clone().confirm_download(key, selected).await
    }

    /// Cancel, tear down, and unregister the session for `key`.
    ///
    /// Cleanup failures are logged and never block unregistration: after
    /// this returns `Ok`, the key is gone from the registry.
    pub async fn remove(&self, key: TorrentKey) -> EngineResult<()> {
        self.inner.remove(key).await
    }

    /// Republish a seeded source after local filesystem changes
    pub async fn sync_seed(&self, key: TorrentKey) -> EngineResult<()> {
        self.inner.sync_seed(key).await
    }

    /// Fetch only the files that changed remotely since the last applied
    /// version
    pub async fn sync_download(&self, key: TorrentKey) -> EngineResult<()> {
        self.inner.sync_download(key).await
    }

    /// Enumerate the drive afresh and return the entries that are new or
    /// differ in size from the last-known file list. Does not mutate the
    /// session. Size-based only: a same-size content edit is not detected.
    pub async fn get_sync_diff(&self, key: TorrentKey) -> EngineResult<Vec<FileEntry>> {
        self.inner.get_sync_diff(key).await
    }

    /// Remove every registered session
    pub async fn shutdown(&self) {
        info!("Shutting down torrent engine");
        let keys: Vec<TorrentKey> = self.inner.sessions.read().await.keys().copied().collect();
        for key in keys {
            if let Err(err) = self.inner.remove(key).await {
                warn!(%key, %err, "Error removing session during shutdown");
            }
        }
    }
}

impl Inner {
    pub(crate) async fn snapshots(&self) -> Vec<TorrentSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshots: Vec<TorrentSnapshot> =
            sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.key.to_hex());
        snapshots
    }

    /// Rebuild and broadcast the full snapshot list
    pub(crate) async fn broadcast(&self) {
        let _ = self.event_tx.send(self.snapshots().await);
    }

    pub(crate) async fn get(&self, key: &TorrentKey) -> Option<Arc<Session>> {
        self.sessions.read().await.get(key).cloned()
    }

    pub(crate) async fn contains(&self, key: &TorrentKey) -> bool {
        self.sessions.read().await.contains_key(key)
    }

    fn require(session: Option<Arc<Session>>, key: &TorrentKey) -> EngineResult<Arc<Session>> {
        session.ok_or_else(|| EngineError::NotFound(key.to_hex()))
    }

    fn namespace_id() -> String {
        let mut bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        format!("sessions/{}", hex::encode(bytes))
    }

    async fn seed(self: Arc<Self>, path: &Path, name: Option<String>) -> EngineResult<TorrentKey> {
        let meta = std::fs::metadata(path)
            .map_err(|_| EngineError::Validation(format!("path not found: {}", path.display())))?;
        let is_dir = meta.is_dir();

        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let display_name = name.unwrap_or_else(|| source_name.clone());

        let namespace = self.provider.open_namespace(&Self::namespace_id()).await?;
        let drive = namespace.create_drive().await?;
        let key = drive.key();
        info!(%key, path = %path.display(), "Starting seed");

        let session = Session::new(
            key,
            SessionRole::Seed,
            SessionState::SeedingInit,
            display_name.clone(),
            drive,
            namespace,
        );
        session.state.write().source_path = Some(path.to_path_buf());
        self.sessions.write().await.insert(key, session.clone());

        monitor::spawn_peer_monitor(&self, &session);
        self.broadcast().await;

        let kind = if is_dir {
            SourceKind::Directory
        } else {
            SourceKind::File
        };
        let result = self
            .write_source_to_drive(&session, path, &display_name, &source_name, kind, false)
            .await;

        match result {
            Ok(()) => {}
            Err(err) if err.is_cancellation() => {
                // Deliberate abort: the session stays registered, without
                // an error, for caller-driven cleanup.
                debug!(%key, "Seed aborted");
                self.broadcast().await;
                return Err(err);
            }
            Err(err) => {
                warn!(%key, %err, "Seed failed, discarding session");
                self.discard(&session).await;
                return Err(err);
            }
        }

        let discovery = match self
            .swarm
            .join(key.discovery_topic(), JoinMode::server_and_client())
            .await
        {
            Ok(discovery) => discovery,
            Err(err) => {
                warn!(%key, %err, "Failed to announce seed, discarding session");
                self.discard(&session).await;
                return Err(err);
            }
        };
        *session.discovery.lock().await = Some(discovery);

        let applied_version = session.drive.version().await;
        {
            let mut state = session.state.write();
            state.state = if is_dir {
                SessionState::SeedingDir
            } else {
                SessionState::Seeding
            };
            state.progress = 100;
            state.applied_version = applied_version;
        }

        if let Err(err) = monitor::spawn_source_watcher(&self, &session, path) {
            warn!(%key, %err, "Failed to watch seed source; local changes will not be flagged");
        }

        info!(%key, "Seed ready");
        self.broadcast().await;
        Ok(key)
    }

    async fn download(
        self: Arc<Self>,
        key: TorrentKey,
        save_dir: Option<PathBuf>,
    ) -> EngineResult<TorrentSnapshot> {
        if let Some(existing) = self.get(&key).await {
            debug!(%key, "Download already registered");
            return Ok(existing.snapshot());
        }

        let save_dir = save_dir.unwrap_or_else(|| self.config.download_dir.clone());
        tokio::fs::create_dir_all(&save_dir).await?;
        info!(%key, save_dir = %save_dir.display(), "Starting download");

        let namespace = self.provider.open_namespace(&Self::namespace_id()).await?;
        let drive = namespace.open_drive(&key).await?;

        let session = Session::new(
            key,
            SessionRole::Download,
            SessionState::DownloadInit,
            format!("torrent-{}", key.short()),
            drive,
            namespace,
        );
        session.state.write().save_dir = Some(save_dir);

        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(&key) {
                // Lost a race with a concurrent download() for the same key
                let snapshot = existing.snapshot();
                drop(sessions);
                let _ = session.drive.close().await;
                let _ = session.namespace.close().await;
                return Ok(snapshot);
            }
            sessions.insert(key, session.clone());
        }

        let discovery = match self
            .swarm
            .join(key.discovery_topic(), JoinMode::server_and_client())
            .await
        {
            Ok(discovery) => discovery,
            Err(err) => {
                warn!(%key, %err, "Failed to join discovery topic, discarding session");
                self.discard(&session).await;
                return Err(err);
            }
        };
        *session.discovery.lock().await = Some(discovery);

        session.state.write().state = SessionState::MetadataFetching;
        monitor::spawn_peer_monitor(&self, &session);
        monitor::spawn_metadata_fetch(&self, &session);
        self.broadcast().await;

        Ok(session.snapshot())
    }

    async fn confirm_download(
        self: Arc<Self>,
        key: TorrentKey,
        selected: Option<Vec<String>>,
    ) -> EngineResult<()> {
        let session = Self::require(self.get(&key).await, &key)?;
        if session.role != SessionRole::Download {
            return Err(EngineError::Validation(format!(
                "torrent {} is a seed, not a download",
                key.to_hex()
            )));
        }

        let effective = {
            let mut state = session.state.write();
            if state.state != SessionState::MetadataReady {
                return Err(EngineError::NotFound(format!(
                    "torrent {} is not awaiting confirmation (state: {})",
                    key.to_hex(),
                    state.state
                )));
            }
            let effective = transfer::resolve_selection(&state.files, selected.as_deref());
            if effective.is_empty() {
                return Err(EngineError::Validation(
                    "selection matches no enumerated files".to_string(),
                ));
            }
            state.selected = selected;
            state.multi_file = effective.len() > 1;
            state.state = if effective.len() > 1 {
                SessionState::DownloadingDir
            } else {
                SessionState::Downloading
            };
            state.progress = 0;
            state.error = None;
            effective
        };

        info!(%key, files = effective.len(), "Download confirmed");
        let inner = self.clone();
        let task_session = session.clone();
        let handle = tokio::spawn(async move {
            transfer::run_initial_transfer(inner, task_session, effective).await;
        });
        session.track_task(handle);

        self.broadcast().await;
        Ok(())
    }

    pub(crate) async fn remove(&self, key: TorrentKey) -> EngineResult<()> {
        let session = Self::require(self.get(&key).await, &key)?;
        info!(%key, "Removing session");

        // Cancellation first, so in-flight loops stop at their next
        // checkpoint, then listeners and watchers before the store closes.
        session.cancel.cancel();
        session.detach();

        if let Some(discovery) = session.discovery.lock().await.take() {
            if let Err(err) = discovery.destroy().await {
                warn!(%key, %err, "Cleanup warning: discovery teardown failed");
            }
        }

        // Grace period for in-flight streams to observe cancellation
        tokio::time::sleep(self.config.remove_grace()).await;

        if let Err(err) = session.drive.close().await {
            warn!(%key, %err, "Cleanup warning: drive close failed");
        }
        if let Err(err) = session.namespace.close().await {
            warn!(%key, %err, "Cleanup warning: namespace close failed");
        }

        self.sessions.write().await.remove(&key);
        self.broadcast().await;
        Ok(())
    }

    /// Unregister and best-effort release a session that failed before
    /// reaching a usable state
    async fn discard(&self, session: &Arc<Session>) {
        session.cancel.cancel();
        session.detach();
        if let Some(discovery) = session.discovery.lock().await.take() {
            let _ = discovery.destroy().await;
        }
        if let Err(err) = session.drive.close().await {
            warn!(key = %session.key, %err, "Cleanup warning: drive close failed");
        }
        if let Err(err) = session.namespace.close().await {
            warn!(key = %session.key, %err, "Cleanup warning: namespace close failed");
        }
        self.sessions.write().await.remove(&session.key);
        self.broadcast().await;
    }
}

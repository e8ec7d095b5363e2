//! Per-torrent session state
//!
//! A [`Session`] is owned by the engine's registry and mutated only through
//! the lifecycle manager. Background tasks (peer monitor, metadata fetch,
//! transfer, pollers, watcher) hold the `Arc` and update the mutable block
//! behind its lock; observers only ever see immutable snapshots.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::{Discovery, Drive, Namespace};
use crate::types::{FileEntry, SessionRole, SessionState, TorrentKey, TorrentSnapshot};

/// One tracked seed or download transfer
pub(crate) struct Session {
    pub key: TorrentKey,
    pub role: SessionRole,
    pub drive: Arc<dyn Drive>,
    pub namespace: Arc<dyn Namespace>,
    /// Cancellation handle threaded through every suspension point
    pub cancel: CancellationToken,
    /// Discovery topic membership, present once announced/joined
    pub discovery: tokio::sync::Mutex<Option<Box<dyn Discovery>>>,
    /// Background tasks to abort on removal
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Filesystem watcher kept alive for the session's lifetime (seed only)
    pub watcher: Mutex<Option<notify::RecommendedWatcher>>,
    pub state: RwLock<SessionMut>,
}

/// The mutable block of a session
pub(crate) struct SessionMut {
    pub state: SessionState,
    pub name: String,
    pub size: u64,
    pub file_count: usize,
    /// Known drive enumeration, replaced wholesale on each (re-)listing
    pub files: Vec<FileEntry>,
    /// Caller's selection recorded at confirmation; `None` means all
    pub selected: Option<Vec<String>>,
    pub progress: u8,
    pub peers: usize,
    /// Whether the confirmed transfer materializes more than one file
    pub multi_file: bool,
    /// Drive version at the last completed full or incremental transfer
    pub applied_version: u64,
    pub has_local_changes: bool,
    pub has_remote_update: bool,
    pub remote_version: Option<u64>,
    pub error: Option<String>,
    pub source_path: Option<PathBuf>,
    pub save_dir: Option<PathBuf>,
}

impl Session {
    pub fn new(
        key: TorrentKey,
        role: SessionRole,
        state: SessionState,
        name: String,
        drive: Arc<dyn Drive>,
        namespace: Arc<dyn Namespace>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            role,
            drive,
            namespace,
            cancel: CancellationToken::new(),
            discovery: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
            state: RwLock::new(SessionMut {
                state,
                name,
                size: 0,
                file_count: 0,
                files: Vec::new(),
                selected: None,
                progress: 0,
                peers: 0,
                multi_file: false,
                applied_version: 0,
                has_local_changes: false,
                has_remote_update: false,
                remote_version: None,
                error: None,
                source_path: None,
                save_dir: None,
            }),
        })
    }

    /// Register a background task for teardown on removal
    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Abort every tracked background task and drop the filesystem watcher
    pub fn detach(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.watcher.lock().take();
    }

    /// Build the externally visible snapshot of this session
    pub fn snapshot(&self) -> TorrentSnapshot {
        let state = self.state.read();
        TorrentSnapshot {
            key: self.key,
            name: state.name.clone(),
            size: state.size,
            state: state.state,
            peers: state.peers,
            progress: state.progress,
            error: state.error.clone(),
            file_count: state.file_count,
            files: if state.files.is_empty() {
                None
            } else {
                Some(state.files.clone())
            },
            has_local_changes: state.has_local_changes,
            has_remote_update: state.has_remote_update,
            remote_version: state.remote_version,
            applied_version: state.applied_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryNet;

    #[tokio::test]
    async fn test_snapshot_reflects_mutable_state() {
        let net = MemoryNet::new();
        let node = net.create_node();
        let ns = node.provider().open_namespace("t").await.unwrap();
        let drive = ns.create_drive().await.unwrap();
        let key = drive.key();

        let session = Session::new(
            key,
            SessionRole::Seed,
            SessionState::SeedingInit,
            "demo".to_string(),
            drive,
            ns,
        );

        {
            let mut state = session.state.write();
            state.progress = 42;
            state.peers = 2;
            state.files = vec![FileEntry {
                path: "/a".to_string(),
                size: 10,
            }];
            state.file_count = 1;
        }

        let snap = session.snapshot();
        assert_eq!(snap.key, key);
        assert_eq!(snap.progress, 42);
        assert_eq!(snap.peers, 2);
        assert_eq!(snap.file_count, 1);
        assert_eq!(snap.files.as_deref().unwrap().len(), 1);
        assert!(snap.error.is_none());
    }
}

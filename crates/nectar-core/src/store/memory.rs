//! In-memory store and swarm for tests and local development
//!
//! A [`MemoryNet`] is a process-local hub standing in for the replication
//! network: every node created from it shares one authoritative copy of
//! each drive, so writes replicate "instantly", while discovery-topic
//! membership still drives peer counts the way a real swarm would. Content
//! written by a seeder node is readable by a downloader node only through
//! the same drive key, and peer-count watches fire when topic membership
//! changes.
//!
//! Drive versions advance by one per committed put or delete.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::store::{
    Discovery, Drive, DriveReader, DriveWriter, JoinMode, Namespace, StoreProvider, Swarm,
};
use crate::types::{DiscoveryTopic, FileEntry, TorrentKey};

type NodeId = u64;

/// Process-local replication hub shared by a set of [`MemoryNode`]s
#[derive(Clone, Default)]
pub struct MemoryNet {
    inner: Arc<NetShared>,
}

#[derive(Default)]
struct NetShared {
    state: Mutex<NetState>,
}

#[derive(Default)]
struct NetState {
    drives: HashMap<TorrentKey, Arc<SharedDrive>>,
    next_node: NodeId,
}

impl MemoryNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new node on this hub. Each node acts as one peer: it has
    /// its own store provider and swarm, both bound to the same identity.
    pub fn create_node(&self) -> MemoryNode {
        let mut state = self.inner.state.lock();
        let id = state.next_node;
        state.next_node += 1;
        MemoryNode {
            net: self.inner.clone(),
            id,
        }
    }
}

impl NetShared {
    fn drive(&self, key: TorrentKey) -> Arc<SharedDrive> {
        let mut state = self.state.lock();
        state
            .drives
            .entry(key)
            .or_insert_with(|| Arc::new(SharedDrive::new(key)))
            .clone()
    }
}

/// One simulated peer: store provider and swarm over a shared [`MemoryNet`]
#[derive(Clone)]
pub struct MemoryNode {
    net: Arc<NetShared>,
    id: NodeId,
}

impl MemoryNode {
    pub fn provider(&self) -> Arc<dyn StoreProvider> {
        Arc::new(self.clone())
    }

    pub fn swarm(&self) -> Arc<dyn Swarm> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl StoreProvider for MemoryNode {
    async fn open_namespace(&self, id: &str) -> EngineResult<Arc<dyn Namespace>> {
        debug!(node = self.id, namespace = id, "Opening memory namespace");
        Ok(Arc::new(MemoryNamespace {
            net: self.net.clone(),
            node: self.id,
            id: id.to_string(),
            open_handles: Arc::new(AtomicUsize::new(0)),
        }))
    }
}

#[async_trait]
impl Swarm for MemoryNode {
    async fn join(&self, topic: DiscoveryTopic, _mode: JoinMode) -> EngineResult<Box<dyn Discovery>> {
        let shared = self.net.drive(TorrentKey::from_bytes(topic.0));
        shared.join(self.id);
        Ok(Box::new(MemoryDiscovery {
            shared,
            node: self.id,
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct MemoryNamespace {
    net: Arc<NetShared>,
    node: NodeId,
    id: String,
    open_handles: Arc<AtomicUsize>,
}

#[async_trait]
impl Namespace for MemoryNamespace {
    async fn create_drive(&self) -> EngineResult<Arc<dyn Drive>> {
        let key = TorrentKey::generate();
        self.open_drive(&key).await
    }

    async fn open_drive(&self, key: &TorrentKey) -> EngineResult<Arc<dyn Drive>> {
        let shared = self.net.drive(*key);
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryDrive {
            peers_rx: shared.register_handle(self.node),
            shared,
            node: self.node,
            namespace_handles: self.open_handles.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> EngineResult<()> {
        let open = self.open_handles.load(Ordering::SeqCst);
        if open > 0 {
            return Err(EngineError::Store(format!(
                "namespace {} still has {} open drive handle(s)",
                self.id, open
            )));
        }
        Ok(())
    }
}

/// Authoritative replicated state of one drive on the hub
struct SharedDrive {
    key: TorrentKey,
    files: RwLock<DriveFiles>,
    topology: Mutex<Topology>,
}

#[derive(Default)]
struct DriveFiles {
    entries: BTreeMap<String, Bytes>,
    version: u64,
}

#[derive(Default)]
struct Topology {
    /// Nodes currently joined to the discovery topic
    members: HashSet<NodeId>,
    /// Peer-count watch senders, one per open drive handle
    handles: Vec<(NodeId, watch::Sender<usize>)>,
}

impl SharedDrive {
    fn new(key: TorrentKey) -> Self {
        Self {
            key,
            files: RwLock::new(DriveFiles::default()),
            topology: Mutex::new(Topology::default()),
        }
    }

    fn register_handle(&self, node: NodeId) -> watch::Receiver<usize> {
        let mut topology = self.topology.lock();
        let initial = topology.members.iter().filter(|m| **m != node).count();
        let (tx, rx) = watch::channel(initial);
        topology.handles.push((node, tx));
        rx
    }

    fn unregister_handles(&self, node: NodeId) {
        let mut topology = self.topology.lock();
        if let Some(pos) = topology.handles.iter().position(|(n, _)| *n == node) {
            topology.handles.remove(pos);
        }
    }

    fn join(&self, node: NodeId) {
        let mut topology = self.topology.lock();
        topology.members.insert(node);
        Self::notify(&topology);
    }

    fn leave(&self, node: NodeId) {
        let mut topology = self.topology.lock();
        topology.members.remove(&node);
        Self::notify(&topology);
    }

    fn notify(topology: &Topology) {
        for (node, tx) in &topology.handles {
            let count = topology.members.iter().filter(|m| **m != *node).count();
            let _ = tx.send(count);
        }
    }

    fn commit(&self, path: &str, bytes: Bytes) {
        let mut files = self.files.write();
        files.entries.insert(path.to_string(), bytes);
        files.version += 1;
    }
}

struct MemoryDrive {
    shared: Arc<SharedDrive>,
    node: NodeId,
    peers_rx: watch::Receiver<usize>,
    namespace_handles: Arc<AtomicUsize>,
    closed: AtomicBool,
}

#[async_trait]
impl Drive for MemoryDrive {
    fn key(&self) -> TorrentKey {
        self.shared.key
    }

    async fn version(&self) -> u64 {
        self.shared.files.read().version
    }

    async fn refresh(&self) -> EngineResult<()> {
        // The hub replicates synchronously; every handle always sees the
        // latest committed state.
        Ok(())
    }

    async fn put(&self, path: &str, bytes: Bytes) -> EngineResult<()> {
        self.shared.commit(path, bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> EngineResult<Option<Bytes>> {
        Ok(self.shared.files.read().entries.get(path).cloned())
    }

    async fn del(&self, path: &str) -> EngineResult<()> {
        let mut files = self.shared.files.write();
        if files.entries.remove(path).is_some() {
            files.version += 1;
        }
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>) -> EngineResult<Vec<FileEntry>> {
        let files = self.shared.files.read();
        Ok(files
            .entries
            .iter()
            .filter(|(path, _)| prefix.map_or(true, |p| path.starts_with(p)))
            .map(|(path, bytes)| FileEntry {
                path: path.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }

    async fn read_stream(&self, path: &str) -> EngineResult<DriveReader> {
        let bytes = self
            .get(path)
            .await?
            .ok_or_else(|| EngineError::Store(format!("no entry at {}", path)))?;
        Ok(Box::pin(Cursor::new(bytes.to_vec())))
    }

    async fn write_stream(&self, path: &str) -> EngineResult<DriveWriter> {
        Ok(Box::pin(MemoryWriter {
            shared: self.shared.clone(),
            path: path.to_string(),
            buf: Vec::new(),
            committed: false,
        }))
    }

    fn peer_count(&self) -> watch::Receiver<usize> {
        self.peers_rx.clone()
    }

    async fn close(&self) -> EngineResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.unregister_handles(self.node);
            self.namespace_handles.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Buffers writes and commits the file (bumping the version) on shutdown
struct MemoryWriter {
    shared: Arc<SharedDrive>,
    path: String,
    buf: Vec<u8>,
    committed: bool,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        this.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if !this.committed {
            this.committed = true;
            this.shared
                .commit(&this.path, Bytes::from(std::mem::take(&mut this.buf)));
        }
        Poll::Ready(Ok(()))
    }
}

struct MemoryDiscovery {
    shared: Arc<SharedDrive>,
    node: NodeId,
    destroyed: AtomicBool,
}

#[async_trait]
impl Discovery for MemoryDiscovery {
    async fn destroy(&self) -> EngineResult<()> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.shared.leave(self.node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_put_get_bumps_version() {
        let net = MemoryNet::new();
        let node = net.create_node();
        let ns = node.provider().open_namespace("t").await.unwrap();
        let drive = ns.create_drive().await.unwrap();

        assert_eq!(drive.version().await, 0);
        drive.put("/a", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(drive.version().await, 1);
        assert_eq!(
            drive.get("/a").await.unwrap().unwrap(),
            Bytes::from_static(b"hello")
        );

        drive.del("/a").await.unwrap();
        assert_eq!(drive.version().await, 2);
        assert!(drive.get("/a").await.unwrap().is_none());
        // Deleting a missing entry does not advance the version
        drive.del("/a").await.unwrap();
        assert_eq!(drive.version().await, 2);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let net = MemoryNet::new();
        let node = net.create_node();
        let ns = node.provider().open_namespace("t").await.unwrap();
        let drive = ns.create_drive().await.unwrap();

        drive.put("/docs/a", Bytes::from_static(b"1")).await.unwrap();
        drive.put("/docs/b", Bytes::from_static(b"22")).await.unwrap();
        drive.put("/img/c", Bytes::from_static(b"333")).await.unwrap();

        let all = drive.list(None).await.unwrap();
        assert_eq!(all.len(), 3);
        let docs = drive.list(Some("/docs/")).await.unwrap();
        assert_eq!(
            docs,
            vec![
                FileEntry {
                    path: "/docs/a".to_string(),
                    size: 1
                },
                FileEntry {
                    path: "/docs/b".to_string(),
                    size: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_content_replicates_between_nodes() {
        let net = MemoryNet::new();
        let seeder = net.create_node();
        let leecher = net.create_node();

        let ns_a = seeder.provider().open_namespace("a").await.unwrap();
        let drive_a = ns_a.create_drive().await.unwrap();
        drive_a.put("/x", Bytes::from_static(b"shared")).await.unwrap();

        let ns_b = leecher.provider().open_namespace("b").await.unwrap();
        let drive_b = ns_b.open_drive(&drive_a.key()).await.unwrap();
        assert_eq!(
            drive_b.get("/x").await.unwrap().unwrap(),
            Bytes::from_static(b"shared")
        );
        assert_eq!(drive_b.version().await, 1);
    }

    #[tokio::test]
    async fn test_peer_counts_follow_topic_membership() {
        let net = MemoryNet::new();
        let seeder = net.create_node();
        let leecher = net.create_node();

        let ns_a = seeder.provider().open_namespace("a").await.unwrap();
        let drive_a = ns_a.create_drive().await.unwrap();
        let topic = drive_a.key().discovery_topic();

        let ns_b = leecher.provider().open_namespace("b").await.unwrap();
        let drive_b = ns_b.open_drive(&drive_a.key()).await.unwrap();

        let mut peers_a = drive_a.peer_count();
        let mut peers_b = drive_b.peer_count();
        assert_eq!(*peers_a.borrow(), 0);
        assert_eq!(*peers_b.borrow(), 0);

        let disc_a = seeder.swarm().join(topic, JoinMode::server_and_client()).await.unwrap();
        let disc_b = leecher.swarm().join(topic, JoinMode::server_and_client()).await.unwrap();

        peers_a.changed().await.unwrap();
        assert_eq!(*peers_a.borrow_and_update(), 1);
        assert_eq!(*peers_b.borrow_and_update(), 1);

        disc_b.destroy().await.unwrap();
        peers_a.changed().await.unwrap();
        assert_eq!(*peers_a.borrow_and_update(), 0);
        disc_a.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_stream_commits_on_shutdown() {
        let net = MemoryNet::new();
        let node = net.create_node();
        let ns = node.provider().open_namespace("t").await.unwrap();
        let drive = ns.create_drive().await.unwrap();

        let mut writer = drive.write_stream("/big").await.unwrap();
        writer.write_all(b"part one ").await.unwrap();
        writer.write_all(b"part two").await.unwrap();
        // Not visible until shutdown
        assert!(drive.get("/big").await.unwrap().is_none());
        writer.shutdown().await.unwrap();

        assert_eq!(
            drive.get("/big").await.unwrap().unwrap(),
            Bytes::from_static(b"part one part two")
        );
        assert_eq!(drive.version().await, 1);

        let mut reader = drive.read_stream("/big").await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "part one part two");
    }

    #[tokio::test]
    async fn test_namespace_close_reports_open_handles() {
        let net = MemoryNet::new();
        let node = net.create_node();
        let ns = node.provider().open_namespace("t").await.unwrap();
        let drive = ns.create_drive().await.unwrap();

        assert!(matches!(ns.close().await, Err(EngineError::Store(_))));
        drive.close().await.unwrap();
        ns.close().await.unwrap();
    }
}

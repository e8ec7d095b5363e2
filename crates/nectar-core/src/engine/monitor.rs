//! Background tasks attached to a session: peer-count monitoring, the
//! metadata negotiation that follows `download()`, the remote-update poll
//! on steady downloads, and the filesystem watcher on seeded sources.
//!
//! Every loop here is gated on the session's cancellation token and stops
//! at its next checkpoint once `remove` fires it.

use std::path::Path;
use std::sync::Arc;

use notify::{EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use super::Inner;
use crate::error::{EngineError, EngineResult};
use crate::session::Session;
use crate::types::{DriveMetadata, SessionState, METADATA_PATH};

/// Mirror the drive's peer-count watch into the session, broadcasting a
/// fresh snapshot list on every change.
pub(crate) fn spawn_peer_monitor(inner: &Arc<Inner>, session: &Arc<Session>) {
    let inner = inner.clone();
    let task_session = session.clone();
    let handle = tokio::spawn(async move {
        let mut rx = task_session.drive.peer_count();
        loop {
            let count = *rx.borrow_and_update();
            let changed = {
                let mut state = task_session.state.write();
                if state.peers != count {
                    state.peers = count;
                    true
                } else {
                    false
                }
            };
            if changed {
                inner.broadcast().await;
            }
            tokio::select! {
                _ = task_session.cancel.cancelled() => break,
                res = rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }
    });
    session.track_task(handle);
}

/// Drive a freshly registered download through metadata negotiation:
/// bounded peer wait, bounded metadata-record polling, unbounded
/// enumeration polling gated on session liveness, then `MetadataReady`.
pub(crate) fn spawn_metadata_fetch(inner: &Arc<Inner>, session: &Arc<Session>) {
    let handle = tokio::spawn(fetch_metadata(inner.clone(), session.clone()));
    session.track_task(handle);
}

async fn fetch_metadata(inner: Arc<Inner>, session: Arc<Session>) {
    let key = session.key;

    // 1. Bounded wait for the first peer. This is the only wait with a
    // timeout; everything later retries while the session stays registered.
    let timeout = inner.config.peer_wait_timeout();
    let mut rx = session.drive.peer_count();
    let wait = async move {
        loop {
            if *rx.borrow_and_update() > 0 {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    };
    let connected = tokio::select! {
        _ = session.cancel.cancelled() => return,
        res = tokio::time::timeout(timeout, wait) => res,
    };
    match connected {
        Ok(true) => debug!(%key, "Peer connected"),
        // Watch closed underneath us: the session is being torn down
        Ok(false) => return,
        Err(_) => {
            warn!(%key, "No peers found");
            let err = EngineError::PeerTimeout(format!(
                "no peer connected within {}s",
                timeout.as_secs()
            ));
            session.state.write().error = Some(err.to_string());
            inner.broadcast().await;
            return;
        }
    }

    // 2. Bounded polling for the metadata record; it may not have
    // replicated yet, and a drive seeded by an older peer may lack it.
    let mut metadata: Option<DriveMetadata> = None;
    for _ in 0..inner.config.metadata_retries {
        if session.cancel.is_cancelled() {
            return;
        }
        if let Err(err) = session.drive.refresh().await {
            warn!(%key, %err, "Drive refresh failed");
        }
        match session.drive.get(METADATA_PATH).await {
            Ok(Some(bytes)) => match DriveMetadata::from_bytes(&bytes) {
                Ok(record) => {
                    metadata = Some(record);
                    break;
                }
                Err(err) => warn!(%key, %err, "Metadata record unreadable, retrying"),
            },
            Ok(None) => {}
            Err(err) => warn!(%key, %err, "Metadata read failed"),
        }
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.config.metadata_retry_interval()) => {}
        }
    }

    // 3. Unbounded polling for a non-empty enumeration, stopping
    // immediately if the session is removed concurrently.
    let entries = loop {
        if session.cancel.is_cancelled() || !inner.contains(&key).await {
            return;
        }
        if let Err(err) = session.drive.refresh().await {
            warn!(%key, %err, "Drive refresh failed");
        }
        match inner.list_payload(&session).await {
            Ok(entries) if !entries.is_empty() => break entries,
            Ok(_) => debug!(%key, "No files replicated yet, retrying"),
            Err(err) => warn!(%key, %err, "Enumeration failed, retrying"),
        }
        tokio::select! {
            _ = session.cancel.cancelled() => return,
            _ = tokio::time::sleep(inner.config.enumeration_retry_interval()) => {}
        }
    };

    let name = display_name(metadata.as_ref(), &entries[0].path)
        .unwrap_or_else(|| format!("torrent-{}", key.short()));
    {
        let mut state = session.state.write();
        state.name = name;
        state.size = entries.iter().map(|e| e.size).sum();
        state.file_count = entries.len();
        state.files = entries;
        state.state = SessionState::MetadataReady;
    }
    info!(%key, "Metadata ready");
    inner.broadcast().await;
}

/// Deterministic display-name fallback chain: metadata logical name,
/// metadata source name, first path segment of the first enumerated file.
fn display_name(metadata: Option<&DriveMetadata>, first_path: &str) -> Option<String> {
    metadata
        .map(|m| m.name.clone())
        .filter(|n| !n.is_empty())
        .or_else(|| {
            metadata
                .map(|m| m.source_name.clone())
                .filter(|n| !n.is_empty())
        })
        .or_else(|| {
            first_path
                .trim_start_matches('/')
                .split('/')
                .next()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
}

/// Periodically refresh a steady download and flag a remote update when
/// the replicated version moves past the applied one. Never downloads
/// automatically.
pub(crate) fn spawn_remote_poller(inner: &Arc<Inner>, session: &Arc<Session>) {
    let inner = inner.clone();
    let task_session = session.clone();
    let handle = tokio::spawn(async move {
        let key = task_session.key;
        loop {
            tokio::select! {
                _ = task_session.cancel.cancelled() => break,
                _ = tokio::time::sleep(inner.config.remote_poll_interval()) => {}
            }
            if !inner.contains(&key).await {
                break;
            }
            if let Err(err) = task_session.drive.refresh().await {
                warn!(%key, %err, "Remote refresh failed");
                continue;
            }
            let version = task_session.drive.version().await;
            let changed = {
                let mut state = task_session.state.write();
                // While a resync transfer is applying, the poller stays
                // quiet; the transfer itself settles the flags.
                if state.state == SessionState::Syncing {
                    false
                } else if version > state.applied_version
                    && (!state.has_remote_update || state.remote_version != Some(version))
                {
                    state.has_remote_update = true;
                    state.remote_version = Some(version);
                    true
                } else {
                    false
                }
            };
            if changed {
                info!(%key, version, "Remote update available");
                inner.broadcast().await;
            }
        }
    });
    session.track_task(handle);
}

/// Watch the seeded source path and flag local drift. The watcher handle
/// lives on the session and dies with it.
pub(crate) fn spawn_source_watcher(
    inner: &Arc<Inner>,
    session: &Arc<Session>,
    path: &Path,
) -> EngineResult<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })
    .map_err(watch_error)?;
    watcher
        .watch(path, RecursiveMode::Recursive)
        .map_err(watch_error)?;
    *session.watcher.lock() = Some(watcher);

    let inner = inner.clone();
    let task_session = session.clone();
    let handle = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = task_session.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                Ok(event) if is_content_change(&event.kind) => {
                    let changed = {
                        let mut state = task_session.state.write();
                        if !state.has_local_changes {
                            state.has_local_changes = true;
                            true
                        } else {
                            false
                        }
                    };
                    if changed {
                        debug!(key = %task_session.key, "Local source changed");
                        inner.broadcast().await;
                    }
                }
                Ok(_) => {}
                Err(err) => warn!(key = %task_session.key, %err, "Watch error"),
            }
        }
    });
    session.track_task(handle);
    Ok(())
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Any | EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn watch_error(err: notify::Error) -> EngineError {
    EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}

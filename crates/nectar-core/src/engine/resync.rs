//! Incremental resynchronization
//!
//! Seeds republish their source wholesale (idempotent overwrite);
//! downloads fetch only the diff set. The diff is size-based: an entry
//! counts as changed when its path is new or its size differs from the
//! last-known enumeration. A same-size content edit is therefore not
//! detected; this coarse policy is part of the API contract.

use std::sync::Arc;

use tracing::{info, warn};

use super::Inner;
use crate::error::{EngineError, EngineResult};
use crate::session::Session;
use crate::types::{FileEntry, SessionRole, SessionState, SourceKind, TorrentKey, METADATA_PATH};

/// Entries in `fresh` that are new or differ in size from `known`
pub fn compute_diff(known: &[FileEntry], fresh: &[FileEntry]) -> Vec<FileEntry> {
    fresh
        .iter()
        .filter(|entry| {
            !known
                .iter()
                .any(|k| k.path == entry.path && k.size == entry.size)
        })
        .cloned()
        .collect()
}

impl Inner {
    /// Enumerate the drive, excluding the internal metadata record
    pub(crate) async fn list_payload(&self, session: &Arc<Session>) -> EngineResult<Vec<FileEntry>> {
        let mut entries = session.drive.list(None).await?;
        entries.retain(|e| e.path != METADATA_PATH);
        Ok(entries)
    }

    pub(crate) async fn get_sync_diff(
        &self,
        key: TorrentKey,
    ) -> EngineResult<Vec<FileEntry>> {
        let session = Self::require(self.get(&key).await, &key)?;
        session.drive.refresh().await?;
        let fresh = self.list_payload(&session).await?;
        let known = session.state.read().files.clone();
        Ok(compute_diff(&known, &fresh))
    }

    pub(crate) async fn sync_seed(&self, key: TorrentKey) -> EngineResult<()> {
        let session = Self::require(self.get(&key).await, &key)?;
        if session.role != SessionRole::Seed {
            return Err(EngineError::Validation(format!(
                "torrent {} is not a seed",
                key.to_hex()
            )));
        }
        let source = session
            .state
            .read()
            .source_path
            .clone()
            .ok_or_else(|| EngineError::Validation("seed has no source path".to_string()))?;

        let prior = {
            let mut state = session.state.write();
            if !state.state.is_steady() {
                return Err(EngineError::Validation(format!(
                    "torrent {} cannot resync in state {}",
                    key.to_hex(),
                    state.state
                )));
            }
            let prior = state.state;
            state.state = SessionState::Syncing;
            state.progress = 0;
            state.error = None;
            prior
        };
        info!(%key, "Reseeding after local changes");
        self.broadcast().await;

        let kind = if prior == SessionState::SeedingDir {
            SourceKind::Directory
        } else {
            SourceKind::File
        };
        let (name, source_name) = {
            let state = session.state.read();
            let source_name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| source.display().to_string());
            (state.name.clone(), source_name)
        };

        let result = self
            .write_source_to_drive(&session, &source, &name, &source_name, kind, true)
            .await;

        match result {
            Ok(()) => {
                let applied_version = session.drive.version().await;
                {
                    let mut state = session.state.write();
                    state.has_local_changes = false;
                    state.applied_version = applied_version;
                    state.state = prior;
                    state.progress = 100;
                }
                info!(%key, applied_version, "Reseed complete");
                self.broadcast().await;
                Ok(())
            }
            Err(err) if err.is_cancellation() => {
                session.state.write().state = prior;
                Err(err)
            }
            Err(err) => {
                warn!(%key, %err, "Reseed failed");
                {
                    let mut state = session.state.write();
                    state.state = prior;
                    state.error = Some(err.to_string());
                }
                self.broadcast().await;
                Err(err)
            }
        }
    }

    pub(crate) async fn sync_download(
        &self,
        key: TorrentKey,
    ) -> EngineResult<()> {
        let session = Self::require(self.get(&key).await, &key)?;
        if session.role != SessionRole::Download {
            return Err(EngineError::Validation(format!(
                "torrent {} is not a download",
                key.to_hex()
            )));
        }

        let prior = {
            let mut state = session.state.write();
            if state.state != SessionState::Steady {
                return Err(EngineError::Validation(format!(
                    "torrent {} cannot resync in state {}",
                    key.to_hex(),
                    state.state
                )));
            }
            let prior = state.state;
            state.state = SessionState::Syncing;
            state.progress = 0;
            state.error = None;
            prior
        };
        self.broadcast().await;

        session.drive.refresh().await?;
        let version_at_sync = session.drive.version().await;
        let fresh = self.list_payload(&session).await?;
        let (known, selected) = {
            let state = session.state.read();
            (state.files.clone(), state.selected.clone())
        };
        // Only the caller's selection is ever materialized, on resync too
        let diff = super::transfer::resolve_selection(
            &compute_diff(&known, &fresh),
            selected.as_deref(),
        );
        info!(%key, changed = diff.len(), version_at_sync, "Resyncing download");

        let result = if diff.is_empty() {
            Ok(())
        } else {
            self.transfer_files(&session, &diff).await
        };

        match result {
            Ok(()) => {
                {
                    let mut state = session.state.write();
                    state.size = fresh.iter().map(|e| e.size).sum();
                    state.file_count = fresh.len();
                    state.files = fresh;
                    state.applied_version = version_at_sync;
                    state.has_remote_update = false;
                    state.remote_version = None;
                    state.state = prior;
                    state.progress = 100;
                }
                info!(%key, "Resync complete");
                self.broadcast().await;
                Ok(())
            }
            Err(err) if err.is_cancellation() => {
                session.state.write().state = prior;
                Err(err)
            }
            Err(err) => {
                // The update badge persists so the caller can retry
                warn!(%key, %err, "Resync failed");
                {
                    let mut state = session.state.write();
                    state.state = prior;
                    state.error = Some(err.to_string());
                }
                self.broadcast().await;
                Err(err)
            }
        }
    }
}

//! Transfer orchestration: seeding payloads into the drive and
//! materializing drive files onto disk, chunk by chunk, with cooperative
//! cancellation at every boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{monitor, Inner};
use crate::error::{EngineError, EngineResult};
use crate::session::Session;
use crate::types::{
    transfer_percent, DriveMetadata, FileEntry, SessionState, SourceKind, METADATA_PATH,
    SINGLE_FILE_PATH,
};
use crate::walk::walk_dir;

const CHUNK_SIZE: usize = 64 * 1024;

/// Narrow a drive enumeration to the caller's selection, preserving
/// enumeration order. `None` selects everything. Selections may be given
/// with or without the leading slash.
pub(crate) fn resolve_selection(
    files: &[FileEntry],
    selected: Option<&[String]>,
) -> Vec<FileEntry> {
    match selected {
        None => files.to_vec(),
        Some(wanted) => files
            .iter()
            .filter(|entry| {
                wanted
                    .iter()
                    .any(|w| entry.path == *w || entry.path == format!("/{}", w))
            })
            .cloned()
            .collect(),
    }
}

/// Destination on disk for one drive entry.
///
/// A multi-file transfer materializes under `save_dir/<name>/`, preserving
/// the drive's hierarchy; a single materialized file lands directly under
/// `save_dir`, named after the session when the drive is a single-file
/// seed and after the entry otherwise.
pub(crate) fn dest_path(save_dir: &Path, name: &str, multi_file: bool, drive_path: &str) -> PathBuf {
    if multi_file {
        save_dir.join(name).join(drive_path.trim_start_matches('/'))
    } else if drive_path == SINGLE_FILE_PATH {
        save_dir.join(name)
    } else {
        let base = drive_path.rsplit('/').next().unwrap_or(drive_path);
        save_dir.join(base)
    }
}

impl Inner {
    /// Write the seed source (file or directory) into the session's drive.
    ///
    /// On the initial seed the metadata record is flushed durably before
    /// any payload bytes so a partially transferred seed is still
    /// identifiable by peers; on a reseed the record is rewritten after
    /// the payload with an updated timestamp.
    pub(crate) async fn write_source_to_drive(
        &self,
        session: &Arc<Session>,
        source: &Path,
        display_name: &str,
        source_name: &str,
        kind: SourceKind,
        reseed: bool,
    ) -> EngineResult<()> {
        let drive = session.drive.clone();

        if !reseed {
            let record = DriveMetadata {
                name: display_name.to_string(),
                source_kind: kind,
                source_name: source_name.to_string(),
                created_at: chrono::Utc::now().to_rfc3339(),
                updated_at: None,
            };
            drive.put(METADATA_PATH, record.to_bytes()?).await?;
        }

        match kind {
            SourceKind::Directory => {
                let files = walk_dir(source)?;
                if files.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "directory is empty: {}",
                        source.display()
                    )));
                }
                let total: u64 = files.iter().map(|f| f.size).sum();
                {
                    let mut state = session.state.write();
                    state.size = total;
                    state.files = Vec::new();
                    state.file_count = 0;
                }
                self.broadcast().await;

                let mut written = 0u64;
                for file in &files {
                    if session.cancel.is_cancelled() {
                        return Err(EngineError::Cancelled);
                    }
                    debug!(key = %session.key, path = %file.drive_path, "Seeding file");
                    let copied = self
                        .copy_into_drive(session, &file.full_path, &file.drive_path)
                        .await?;
                    written += copied;
                    {
                        let mut state = session.state.write();
                        state.files.push(FileEntry {
                            path: file.drive_path.clone(),
                            size: copied,
                        });
                        state.file_count = state.files.len();
                        state.progress = transfer_percent(written, total);
                    }
                    self.broadcast().await;
                }
            }
            SourceKind::File => {
                let size = std::fs::metadata(source)?.len();
                {
                    let mut state = session.state.write();
                    state.size = size;
                }
                self.broadcast().await;

                let copied = self.copy_into_drive(session, source, SINGLE_FILE_PATH).await?;
                {
                    let mut state = session.state.write();
                    state.files = vec![FileEntry {
                        path: SINGLE_FILE_PATH.to_string(),
                        size: copied,
                    }];
                    state.file_count = 1;
                    state.size = copied;
                }
                self.broadcast().await;
            }
        }

        if reseed {
            let prior = match drive.get(METADATA_PATH).await? {
                Some(bytes) => DriveMetadata::from_bytes(&bytes).ok(),
                None => None,
            };
            let record = DriveMetadata {
                name: display_name.to_string(),
                source_kind: kind,
                source_name: source_name.to_string(),
                created_at: prior
                    .map(|p| p.created_at)
                    .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
                updated_at: Some(chrono::Utc::now().to_rfc3339()),
            };
            drive.put(METADATA_PATH, record.to_bytes()?).await?;
        }

        Ok(())
    }

    /// Stream one local file into the drive, checking cancellation between
    /// chunks. Returns the number of bytes copied.
    async fn copy_into_drive(
        &self,
        session: &Arc<Session>,
        from: &Path,
        drive_path: &str,
    ) -> EngineResult<u64> {
        let mut reader = tokio::fs::File::open(from).await?;
        let mut writer = session.drive.write_stream(drive_path).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut copied = 0u64;
        loop {
            let n = tokio::select! {
                _ = session.cancel.cancelled() => return Err(EngineError::Cancelled),
                read = reader.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| EngineError::Transfer(e.to_string()))?;
            copied += n as u64;
        }
        writer
            .shutdown()
            .await
            .map_err(|e| EngineError::Transfer(e.to_string()))?;
        Ok(copied)
    }

    /// Materialize the given drive entries onto disk, accounting progress
    /// against their summed size and broadcasting on every change.
    pub(crate) async fn transfer_files(
        &self,
        session: &Arc<Session>,
        files: &[FileEntry],
    ) -> EngineResult<()> {
        let (save_dir, name, multi_file) = {
            let state = session.state.read();
            let save_dir = state.save_dir.clone().ok_or_else(|| {
                EngineError::Validation("session has no save directory".to_string())
            })?;
            (save_dir, state.name.clone(), state.multi_file)
        };

        let total: u64 = files.iter().map(|f| f.size).sum();
        let mut done = 0u64;
        let mut buf = vec![0u8; CHUNK_SIZE];

        for entry in files {
            if session.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let dest = dest_path(&save_dir, &name, multi_file, &entry.path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            debug!(key = %session.key, path = %entry.path, dest = %dest.display(), "Fetching file");

            let mut reader = session.drive.read_stream(&entry.path).await?;
            let mut out = tokio::fs::File::create(&dest).await?;
            loop {
                let n = tokio::select! {
                    _ = session.cancel.cancelled() => return Err(EngineError::Cancelled),
                    read = reader.read(&mut buf) => {
                        read.map_err(|e| EngineError::Transfer(e.to_string()))?
                    }
                };
                if n == 0 {
                    break;
                }
                out.write_all(&buf[..n]).await?;
                done += n as u64;

                let pct = transfer_percent(done, total);
                let changed = {
                    let mut state = session.state.write();
                    if state.progress != pct {
                        state.progress = pct;
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.broadcast().await;
                }
            }
            out.flush().await?;
        }
        Ok(())
    }
}

/// Body of the spawned initial-transfer task started by a confirmation.
///
/// On success the session settles in `Steady` with `applied_version` set
/// to the drive version observed at fetch time, and the remote-update
/// poller starts. Cancellation stops silently; any other failure is
/// recorded on the session, which stays registered.
pub(crate) async fn run_initial_transfer(
    inner: Arc<Inner>,
    session: Arc<Session>,
    files: Vec<FileEntry>,
) {
    let version_at_fetch = session.drive.version().await;

    match inner.transfer_files(&session, &files).await {
        Ok(()) => {
            {
                let mut state = session.state.write();
                state.progress = 100;
                state.applied_version = version_at_fetch;
                state.state = SessionState::Steady;
            }
            info!(key = %session.key, "Download complete");
            monitor::spawn_remote_poller(&inner, &session);
            inner.broadcast().await;
        }
        Err(err) if err.is_cancellation() => {
            debug!(key = %session.key, "Download aborted");
        }
        Err(err) => {
            warn!(key = %session.key, %err, "Download failed");
            if inner.contains(&session.key).await {
                session.state.write().error = Some(err.to_string());
                inner.broadcast().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            size,
        }
    }

    #[test]
    fn test_resolve_selection_none_takes_all() {
        let files = vec![entry("/a", 10), entry("/b", 20)];
        assert_eq!(resolve_selection(&files, None), files);
    }

    #[test]
    fn test_resolve_selection_accepts_bare_and_slashed_paths() {
        let files = vec![entry("/a", 10), entry("/b", 20), entry("/c", 30)];
        let selected = vec!["a".to_string(), "/c".to_string()];
        let resolved = resolve_selection(&files, Some(&selected));
        assert_eq!(resolved, vec![entry("/a", 10), entry("/c", 30)]);
    }

    #[test]
    fn test_resolve_selection_preserves_enumeration_order() {
        let files = vec![entry("/a", 1), entry("/b", 2), entry("/c", 3)];
        let selected = vec!["c".to_string(), "a".to_string()];
        let resolved = resolve_selection(&files, Some(&selected));
        assert_eq!(resolved, vec![entry("/a", 1), entry("/c", 3)]);
    }

    #[test]
    fn test_dest_path_layouts() {
        let save = Path::new("/downloads");
        assert_eq!(
            dest_path(save, "album", true, "/disc1/track01.flac"),
            PathBuf::from("/downloads/album/disc1/track01.flac")
        );
        assert_eq!(
            dest_path(save, "report.pdf", false, SINGLE_FILE_PATH),
            PathBuf::from("/downloads/report.pdf")
        );
        assert_eq!(
            dest_path(save, "album", false, "/disc1/track01.flac"),
            PathBuf::from("/downloads/track01.flac")
        );
    }
}

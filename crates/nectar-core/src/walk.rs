//! Recursive directory enumeration for seeding
//!
//! A single walk yields every regular file with its source path, its
//! logical drive path, and its size, so size-accounting and transfer share
//! one filesystem traversal.

use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// One file discovered under a seeded directory
#[derive(Debug, Clone, PartialEq)]
pub struct WalkedFile {
    /// Absolute (or caller-relative) path on the local filesystem
    pub full_path: PathBuf,
    /// Logical drive path: `/`-separated, rooted with a leading slash
    pub drive_path: String,
    /// Size in bytes at walk time
    pub size: u64,
}

/// Walk `root` recursively and return every regular file in deterministic
/// (lexicographic) order. Symlinks are not followed.
pub fn walk_dir(root: &Path) -> EngineResult<Vec<WalkedFile>> {
    let mut files = Vec::new();
    walk_into(root, root, &mut files)?;
    files.sort_by(|a, b| a.drive_path.cmp(&b.drive_path));
    Ok(files)
}

fn walk_into(root: &Path, dir: &Path, out: &mut Vec<WalkedFile>) -> EngineResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_into(root, &path, out)?;
        } else if file_type.is_file() {
            let size = entry.metadata()?.len();
            out.push(WalkedFile {
                drive_path: drive_path_for(root, &path)?,
                full_path: path,
                size,
            });
        }
        // Symlinks and other special files are skipped
    }
    Ok(())
}

fn drive_path_for(root: &Path, path: &Path) -> EngineResult<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        EngineError::Validation(format!("path {:?} escapes walk root {:?}", path, root))
    })?;
    let mut logical = String::new();
    for component in rel.components() {
        logical.push('/');
        logical.push_str(&component.as_os_str().to_string_lossy());
    }
    Ok(logical)
}

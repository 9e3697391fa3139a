use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::paths::relative_key;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("source folder does not exist or is not a directory: {0}")]
    InvalidRoot(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Folder,
    File,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Folder => "folder",
            ItemKind::File => "file",
        }
    }
}

/// One item found under the scan root. `size` and `modified_time` are zero for folders.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntry {
    pub relative_path: String,
    pub name: String,
    pub full_path: PathBuf,
    pub kind: ItemKind,
    pub size: u64,
    /// Seconds since the Unix epoch, with sub-second precision.
    pub modified_time: f64,
}

impl LocalEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }
}

/// Lazy, depth-first walk of a local folder.
///
/// Entries come out sorted by name within each directory, and a folder is
/// always yielded before anything inside it. The root itself is not yielded.
/// Entries that cannot be read are logged and skipped.
pub struct LocalScan {
    root: PathBuf,
    walker: walkdir::IntoIter,
}

pub fn scan(root: &Path) -> Result<LocalScan, ScanError> {
    if !root.is_dir() {
        return Err(ScanError::InvalidRoot(root.to_path_buf()));
    }
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    Ok(LocalScan {
        root: root.to_path_buf(),
        walker,
    })
}

impl LocalScan {
    fn to_local_entry(&self, entry: &DirEntry) -> Option<LocalEntry> {
        let relative_path = match relative_key(&self.root, entry.path()) {
            Ok(key) => key,
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "skipping entry");
                return None;
            }
        };
        let name = entry.file_name().to_string_lossy().into_owned();

        if entry.file_type().is_dir() {
            return Some(LocalEntry {
                relative_path,
                name,
                full_path: entry.path().to_path_buf(),
                kind: ItemKind::Folder,
                size: 0,
                modified_time: 0.0,
            });
        }

        // symlinks are resolved; linked directories are not descended into
        let metadata = match fs::metadata(entry.path()) {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(path = %relative_path, error = %err, "cannot read metadata, skipping");
                return None;
            }
        };
        if metadata.is_dir() {
            debug!(path = %relative_path, "skipping symlinked directory");
            return None;
        }
        if !metadata.is_file() {
            debug!(path = %relative_path, "skipping special file");
            return None;
        }

        let modified_time = match metadata
            .modified()
            .map(|time| time.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()))
        {
            Ok(Ok(seconds)) => seconds,
            Ok(Err(_)) => 0.0,
            Err(err) => {
                warn!(path = %relative_path, error = %err, "cannot read modification time, skipping");
                return None;
            }
        };

        Some(LocalEntry {
            relative_path,
            name,
            full_path: entry.path().to_path_buf(),
            kind: ItemKind::File,
            size: metadata.len(),
            modified_time,
        })
    }
}

impl Iterator for LocalScan {
    type Item = LocalEntry;

    fn next(&mut self) -> Option<LocalEntry> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    warn!(path = %path, error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if let Some(local) = self.to_local_entry(&entry) {
                return Some(local);
            }
        }
    }
}

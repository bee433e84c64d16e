//! Destination storage tree.
//!
//! The relocator and resume index only need a handful of primitives, so the
//! destination may be a plain directory, a network mount, or anything else
//! that implements [`Storage`].

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::retry::FailureKind;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl StorageError {
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// Connection or timeout failures from network-backed storage are worth
    /// re-processing the item for; everything else is terminal for the item.
    pub fn transient_kind(&self) -> Option<FailureKind> {
        let StorageError::Io { source, .. } = self;
        match source.kind() {
            io::ErrorKind::TimedOut => Some(FailureKind::Timeout),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe => Some(FailureKind::Connection),
            _ => None,
        }
    }
}

/// Storage primitives used by the pipeline. Paths are full paths inside the
/// tree; `move_file` sources are always local staging files.
pub trait Storage: Sync {
    /// Create `dir` (and parents) if missing.
    fn ensure_dir(&self, dir: &Path) -> Result<(), StorageError>;

    /// Regular files directly inside `dir` as `(name, size)`. Directories and
    /// symlinks are not listed.
    fn list_files(&self, dir: &Path) -> Result<Vec<(String, u64)>, StorageError>;

    fn exists(&self, path: &Path) -> bool;

    fn file_size(&self, path: &Path) -> Result<u64, StorageError>;

    /// Move a local file into the tree.
    fn move_file(&self, from: &Path, to: &Path) -> Result<(), StorageError>;

    fn delete_file(&self, path: &Path) -> Result<(), StorageError>;

    /// Open a file in the tree for reading (digest verification).
    fn open(&self, path: &Path) -> Result<Box<dyn Read + '_>, StorageError>;
}

/// Storage tree backed by the local filesystem (including FUSE/network mounts).
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl Storage for LocalStorage {
    fn ensure_dir(&self, dir: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(dir).map_err(|e| StorageError::io("create", dir, e))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<(String, u64)>, StorageError> {
        let entries = fs::read_dir(dir).map_err(|e| StorageError::io("list", dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("list", dir, e))?;
            // file_type() does not follow symlinks
            let file_type = entry
                .file_type()
                .map_err(|e| StorageError::io("stat", &entry.path(), e))?;
            if !file_type.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::debug!("Ignoring non-UTF-8 filename {:?}", entry.file_name());
                continue;
            };
            let size = entry
                .metadata()
                .map_err(|e| StorageError::io("stat", &entry.path(), e))?
                .len();
            files.push((name, size));
        }
        Ok(files)
    }

    fn exists(&self, path: &Path) -> bool {
        path.symlink_metadata().is_ok()
    }

    fn file_size(&self, path: &Path) -> Result<u64, StorageError> {
        fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| StorageError::io("stat", path, e))
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        match fs::rename(from, to) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::io("move", from, e))
            }
            Err(e) => {
                // Rename fails across filesystems (e.g. local disk -> mounted
                // drive); fall back to copy + delete.
                tracing::debug!(
                    "rename {} -> {} failed ({}), copying instead",
                    from.display(),
                    to.display(),
                    e
                );
                copy_into(from, to)?;
                if let Err(e) = fs::remove_file(from) {
                    tracing::warn!("Could not remove {} after copy: {}", from.display(), e);
                }
                Ok(())
            }
        }
    }

    fn delete_file(&self, path: &Path) -> Result<(), StorageError> {
        fs::remove_file(path).map_err(|e| StorageError::io("delete", path, e))
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + '_>, StorageError> {
        let file = fs::File::open(path).map_err(|e| StorageError::io("open", path, e))?;
        Ok(Box::new(file))
    }
}

/// Copy through a hidden sibling of `to` and rename it into place, so an
/// interrupted copy never leaves a partial file under the final name.
fn copy_into(from: &Path, to: &Path) -> Result<(), StorageError> {
    let name = to
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = to.with_file_name(format!(".{}.part", name));

    let result = fs::copy(from, &tmp)
        .map_err(|e| StorageError::io("copy", to, e))
        .and_then(|_| fs::rename(&tmp, to).map_err(|e| StorageError::io("rename", to, e)));
    if result.is_err() {
        if let Err(e) = fs::remove_file(&tmp) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {}: {}", tmp.display(), e);
            }
        }
    }
    result
}

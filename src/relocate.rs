//! Move a staged download into the destination tree and verify it arrived
//! intact.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::download::paths::unique_path;
use crate::retry::FailureKind;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum RelocateError {
    /// Connection or timeout failure from the storage tree. The item is worth
    /// re-processing after a cooldown.
    #[error("{source}")]
    Transient {
        kind: FailureKind,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(StorageError),

    #[error("cannot read staged file {}: {source}", .path.display())]
    Staged {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("size mismatch after move: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("checksum mismatch after move")]
    DigestMismatch,
}

impl RelocateError {
    fn from_storage(e: StorageError) -> Self {
        match e.transient_kind() {
            Some(kind) => RelocateError::Transient { kind, source: e },
            None => RelocateError::Storage(e),
        }
    }

    pub fn transient_kind(&self) -> Option<FailureKind> {
        match self {
            RelocateError::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// A verified file in the destination tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocated {
    pub path: PathBuf,
    pub size: u64,
}

pub struct Relocator<'a> {
    storage: &'a dyn Storage,
    /// Files at or below this size are hash-verified after the move.
    digest_threshold: u64,
}

impl<'a> Relocator<'a> {
    pub fn new(storage: &'a dyn Storage, digest_threshold: u64) -> Self {
        Self {
            storage,
            digest_threshold,
        }
    }

    /// Move `staged` to a conflict-free path for `filename` under `dest_dir`.
    ///
    /// The returned path holds exactly the staged bytes. On a size or digest
    /// mismatch the destination copy is deleted. The staging file is removed
    /// on success.
    pub fn relocate(
        &self,
        staged: &Path,
        dest_dir: &Path,
        filename: &str,
    ) -> Result<Relocated, RelocateError> {
        let expected = fs::metadata(staged)
            .map_err(|source| RelocateError::Staged {
                path: staged.to_path_buf(),
                source,
            })?
            .len();

        let digest = if expected <= self.digest_threshold {
            let file = fs::File::open(staged).map_err(|source| RelocateError::Staged {
                path: staged.to_path_buf(),
                source,
            })?;
            Some(sha256(file).map_err(|source| RelocateError::Staged {
                path: staged.to_path_buf(),
                source,
            })?)
        } else {
            None
        };

        let dest = unique_path(dest_dir, filename, |p| self.storage.exists(p));
        if dest.file_name().and_then(|n| n.to_str()) != Some(filename) {
            tracing::info!(
                "{} already exists in destination, saving as {}",
                filename,
                dest.display()
            );
        }

        if let Err(e) = self.storage.move_file(staged, &dest) {
            // An interrupted copy must not look like a mirrored file next run
            if self.storage.exists(&dest) {
                tracing::warn!("Removing partial copy {}: {}", dest.display(), e);
                if let Err(del) = self.storage.delete_file(&dest) {
                    tracing::warn!("Could not remove {}: {}", dest.display(), del);
                }
            }
            return Err(RelocateError::from_storage(e));
        }

        if let Err(e) = self.verify(&dest, expected, digest) {
            tracing::warn!("Removing unverified copy {}: {}", dest.display(), e);
            if let Err(del) = self.storage.delete_file(&dest) {
                tracing::warn!("Could not remove {}: {}", dest.display(), del);
            }
            return Err(e);
        }

        // Copy-based moves may leave the source behind
        if staged.exists() {
            if let Err(e) = fs::remove_file(staged) {
                tracing::warn!("Could not remove staged file {}: {}", staged.display(), e);
            }
        }

        tracing::debug!("Relocated {} ({} bytes)", dest.display(), expected);
        Ok(Relocated {
            path: dest,
            size: expected,
        })
    }

    fn verify(
        &self,
        dest: &Path,
        expected: u64,
        digest: Option<[u8; 32]>,
    ) -> Result<(), RelocateError> {
        let actual = self
            .storage
            .file_size(dest)
            .map_err(RelocateError::from_storage)?;
        if actual != expected {
            return Err(RelocateError::SizeMismatch { expected, actual });
        }

        if let Some(expected_digest) = digest {
            let reader = self.storage.open(dest).map_err(RelocateError::from_storage)?;
            let actual_digest = sha256(reader).map_err(|e| {
                RelocateError::from_storage(StorageError::io("read", dest, e))
            })?;
            if actual_digest != expected_digest {
                return Err(RelocateError::DigestMismatch);
            }
        }
        Ok(())
    }
}

/// Incremental SHA-256 so large files are never buffered whole.
fn sha256(mut reader: impl Read) -> io::Result<[u8; 32]> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

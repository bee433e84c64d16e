//! Pre-run snapshot of the destination directory.
//!
//! Built exactly once per run and never refreshed: a file that appears in the
//! destination mid-run is not a resume source.

use std::collections::HashMap;
use std::path::Path;

use crate::storage::{Storage, StorageError};

#[derive(Debug, Default, Clone)]
pub struct ResumeIndex {
    files: HashMap<String, u64>,
}

impl ResumeIndex {
    /// List the regular files in `destination` once.
    pub fn build(storage: &dyn Storage, destination: &Path) -> Result<Self, StorageError> {
        let files = storage.list_files(destination)?.into_iter().collect();
        Ok(Self { files })
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files.contains_key(filename)
    }

    pub fn size_of(&self, filename: &str) -> Option<u64> {
        self.files.get(filename).copied()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

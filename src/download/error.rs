use std::path::PathBuf;

use thiserror::Error;

use crate::retry::FailureKind;

/// Terminal outcome of a failed [`super::Downloader::fetch`].
///
/// Individual attempt errors are retried inside the downloader; only the
/// final classification surfaces here.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{} after {attempts} attempts: {last_error}", .kind.label())]
    Exhausted {
        kind: FailureKind,
        attempts: u32,
        last_error: String,
    },

    #[error("download produced a missing or empty file: {}", .0.display())]
    Empty(PathBuf),

    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Short reason recorded with the item's `Failed(download, ..)` outcome.
    pub fn reason(&self) -> String {
        match self {
            FetchError::Exhausted {
                kind, last_error, ..
            } => format!("{}: {}", kind.label(), last_error),
            FetchError::Empty(_) => "empty".to_string(),
            FetchError::Cancelled => "cancelled".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

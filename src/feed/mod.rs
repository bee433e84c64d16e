//! Message feed collaborator.
//!
//! The pipeline only sees the [`FeedClient`] trait: resolve a channel,
//! enumerate its messages lazily, and download one message's media into a
//! local path. [`http::HttpFeedClient`] is the bundled implementation.

pub mod http;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::FailureKind;
use crate::types::EnumerationOrder;

/// Errors surfaced by a feed client.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("rate limited by upstream, retry after {}s", .wait.as_secs())]
    RateLimited { wait: Duration },

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unexpected response: {0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FeedError {
    /// Partition into the downloader's retry classes.
    pub fn kind(&self) -> FailureKind {
        match self {
            FeedError::RateLimited { wait } => FailureKind::RateLimited(*wait),
            FeedError::Timeout(_) => FailureKind::Timeout,
            FeedError::Connection(_) => FailureKind::Connection,
            FeedError::NotFound(_) | FeedError::Other(_) | FeedError::Io(_) => FailureKind::Other,
        }
    }
}

/// Normalized target channel identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelIdentity {
    /// Public handle, always stored with a leading `@`.
    Username(String),
    /// Numeric id, e.g. `-1001234567890` for private channels.
    Numeric(i64),
}

impl ChannelIdentity {
    /// Accepts `@name`, `name`, `https://t.me/name` or a numeric id.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if let Ok(id) = trimmed.parse::<i64>() {
            return Some(ChannelIdentity::Numeric(id));
        }
        let name = match trimmed
            .strip_prefix("https://t.me/")
            .or_else(|| trimmed.strip_prefix("http://t.me/"))
            .or_else(|| trimmed.strip_prefix("t.me/"))
        {
            Some(path) => {
                let path = path.trim_matches('/');
                path.rsplit('/').next().unwrap_or(path)
            }
            None => trimmed,
        };
        let name = name.trim_start_matches('@');
        if name.is_empty() {
            return None;
        }
        Some(ChannelIdentity::Username(format!("@{}", name)))
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelIdentity::Username(name) => f.write_str(name),
            ChannelIdentity::Numeric(id) => write!(f, "{}", id),
        }
    }
}

/// A resolved channel handle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Media attached to a feed message. Closed set of kinds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Media {
    Document {
        id: i64,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
        size: u64,
    },
    Photo {
        id: i64,
        #[serde(default)]
        size: Option<u64>,
    },
    /// Any attachment kind this mirror cannot download.
    #[serde(other)]
    Unsupported,
}

/// One raw feed entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedMessage {
    pub id: i64,
    #[serde(default)]
    pub channel_id: i64,
    #[serde(default)]
    pub media: Option<Media>,
}

impl FeedMessage {
    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

/// Push-style progress callback: `(bytes_received, total_bytes)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Sync);

/// One download attempt handed to the feed client.
pub struct DownloadRequest<'a> {
    pub message: &'a FeedMessage,
    pub dest: &'a Path,
    /// Deadline for the whole attempt.
    pub timeout: Duration,
    pub progress: Option<ProgressFn<'a>>,
}

pub type MessageIter<'a> = Box<dyn Iterator<Item = Result<FeedMessage, FeedError>> + 'a>;

/// Connected feed client. All calls block.
pub trait FeedClient: Sync {
    /// Channels the credentials can read.
    fn list_channels(&self) -> Result<Vec<Channel>, FeedError>;

    /// Resolve an identity; [`FeedError::NotFound`] when unknown.
    fn resolve(&self, identity: &ChannelIdentity) -> Result<Channel, FeedError>;

    /// Lazily enumerate messages. Restartable only by calling again.
    fn iterate<'a>(
        &'a self,
        channel: &Channel,
        order: EnumerationOrder,
    ) -> Result<MessageIter<'a>, FeedError>;

    /// Write the message's media to `request.dest` and return the local path.
    fn download(&self, request: &DownloadRequest<'_>) -> Result<PathBuf, FeedError>;
}

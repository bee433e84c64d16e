//! Mirror orchestrator: drives every item of a channel through
//! extract → resume check → download → relocate, strictly one at a time.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::download::{Downloader, TransferConfig};
use crate::feed::{Channel, ChannelIdentity, FeedClient, FeedError, FeedMessage};
use crate::media::{self, Item};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::relocate::{RelocateError, Relocator};
use crate::resume::ResumeIndex;
use crate::retry::RunRetryPolicy;
use crate::shutdown::sleep_or_cancel;
use crate::storage::{Storage, StorageError};
use crate::types::EnumerationOrder;

/// Immutable parameters of one run.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub staging_dir: PathBuf,
    pub destination_dir: PathBuf,
    pub order: EnumerationOrder,
    pub transfer: TransferConfig,
    /// Relocated files at or below this size are hash-verified.
    pub digest_threshold: u64,
    pub run_retry: RunRetryPolicy,
}

impl MirrorConfig {
    pub fn new(staging_dir: PathBuf, destination_dir: PathBuf) -> Self {
        Self {
            staging_dir,
            destination_dir,
            order: EnumerationOrder::default(),
            transfer: TransferConfig::default(),
            digest_threshold: 100 * 1024 * 1024,
            run_retry: RunRetryPolicy::default(),
        }
    }
}

/// Step of the item pipeline a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Extract,
    Download,
    Upload,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureStage::Extract => "extract",
            FailureStage::Download => "download",
            FailureStage::Upload => "upload",
        })
    }
}

/// Final state of one item. Recorded once and never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Already present in the destination snapshot.
    Skipped { existing_size: Option<u64> },
    Completed { bytes: u64, path: PathBuf },
    Failed { stage: FailureStage, reason: String },
}

#[derive(Debug, Clone)]
pub struct RunStats {
    pub downloaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub total_bytes: u64,
    pub started_at: DateTime<Utc>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            downloaded: 0,
            skipped: 0,
            failed: 0,
            total_bytes: 0,
            started_at: Utc::now(),
        }
    }
}

impl RunStats {
    /// Items resolved so far, in any terminal state.
    pub fn resolved(&self) -> u64 {
        self.downloaded + self.skipped + self.failed
    }

    pub fn elapsed(&self) -> std::time::Duration {
        (Utc::now() - self.started_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Finished,
    /// Stopped at an item boundary by cooperative cancellation.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub id: i64,
    pub filename: String,
    pub outcome: TransferOutcome,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub channel: Channel,
    pub outcome: RunOutcome,
    pub stats: RunStats,
    pub items: Vec<ItemRecord>,
}

/// Conditions that end the run before any item is processed.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("channel {0} not found")]
    NotFound(String),

    #[error("feed unreachable: {0}")]
    FeedUnreachable(#[source] FeedError),

    #[error("cannot prepare {}: {source}", .path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
}

pub struct Mirror<'a, F: FeedClient + ?Sized> {
    feed: &'a F,
    storage: &'a dyn Storage,
    config: &'a MirrorConfig,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
    stats: RunStats,
}

impl<'a, F: FeedClient + ?Sized> Mirror<'a, F> {
    pub fn new(
        feed: &'a F,
        storage: &'a dyn Storage,
        config: &'a MirrorConfig,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            feed,
            storage,
            config,
            sink,
            cancel,
            stats: RunStats::default(),
        }
    }

    /// Mirror every media item of `identity` into the destination.
    ///
    /// Per-item failures are recorded in the report; only setup problems and
    /// an unreachable or unknown channel return `Err`.
    pub fn run(mut self, identity: &ChannelIdentity) -> Result<RunReport, MirrorError> {
        self.stats = RunStats::default();

        let (channel, messages, snapshot) = match self.prepare(identity) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.emit(ProgressEvent::Error {
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let total = messages.len();
        if snapshot.is_empty() {
            tracing::debug!("Destination is empty, every item will be transferred");
        }
        tracing::info!(
            "Found {} media items in {} ({} files already in destination)",
            total,
            channel.title,
            snapshot.len()
        );
        self.emit(ProgressEvent::Started { total });

        let config = self.config;
        let downloader = Downloader::new(self.feed, &config.transfer, self.sink, self.cancel);
        let relocator = Relocator::new(self.storage, config.digest_threshold);

        let mut items = Vec::with_capacity(total);
        let mut outcome = RunOutcome::Finished;
        for (i, message) in messages.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                outcome = RunOutcome::Cancelled;
                break;
            }
            match self.process(i + 1, total, message, &snapshot, &downloader, &relocator) {
                Some(record) => items.push(record),
                None => {
                    outcome = RunOutcome::Cancelled;
                    break;
                }
            }
        }

        if outcome == RunOutcome::Cancelled {
            tracing::info!(
                "Run cancelled after {} of {} items",
                self.stats.resolved(),
                total
            );
        }
        self.emit(ProgressEvent::Finished {
            total,
            downloaded: self.stats.downloaded,
            skipped: self.stats.skipped,
            failed: self.stats.failed,
            total_bytes: self.stats.total_bytes,
        });

        Ok(RunReport {
            channel,
            outcome,
            stats: self.stats,
            items,
        })
    }

    /// Resolve the channel, prepare directories, snapshot the destination and
    /// collect the media messages.
    fn prepare(
        &self,
        identity: &ChannelIdentity,
    ) -> Result<(Channel, Vec<FeedMessage>, ResumeIndex), MirrorError> {
        let channel = match self.feed.resolve(identity) {
            Ok(channel) => channel,
            Err(FeedError::NotFound(_)) => return Err(MirrorError::NotFound(identity.to_string())),
            Err(e) => return Err(MirrorError::FeedUnreachable(e)),
        };
        tracing::info!("Resolved {} to \"{}\" (id {})", identity, channel.title, channel.id);

        let staging = &self.config.staging_dir;
        fs::create_dir_all(staging).map_err(|e| MirrorError::Setup {
            path: staging.clone(),
            source: StorageError::io("create", staging, e),
        })?;
        let destination = &self.config.destination_dir;
        self.storage
            .ensure_dir(destination)
            .map_err(|source| MirrorError::Setup {
                path: destination.clone(),
                source,
            })?;

        let snapshot =
            ResumeIndex::build(self.storage, destination).map_err(|source| MirrorError::Setup {
                path: destination.clone(),
                source,
            })?;

        let mut messages = Vec::new();
        let iter = self
            .feed
            .iterate(&channel, self.config.order)
            .map_err(MirrorError::FeedUnreachable)?;
        for message in iter {
            let message = message.map_err(MirrorError::FeedUnreachable)?;
            if message.has_media() {
                messages.push(message);
            }
        }

        Ok((channel, messages, snapshot))
    }

    /// Drive one item to a terminal state. `None` when cancellation
    /// interrupted it; such an item is not recorded.
    fn process(
        &mut self,
        index: usize,
        total: usize,
        message: FeedMessage,
        snapshot: &ResumeIndex,
        downloader: &Downloader<'_, F>,
        relocator: &Relocator<'_>,
    ) -> Option<ItemRecord> {
        let id = message.id;
        let Some(info) = media::extract(&message) else {
            let filename = format!("message_{}", id);
            tracing::warn!("[{}/{}] message {} has no supported media", index, total, id);
            let outcome = self.fail(
                index,
                total,
                &filename,
                FailureStage::Extract,
                "no supported media".to_string(),
            );
            return Some(ItemRecord {
                id,
                filename,
                outcome,
            });
        };
        let item = Item::new(message, info);

        if snapshot.contains(&item.filename) {
            self.stats.skipped += 1;
            self.stats.total_bytes += item.declared_size.unwrap_or(0);
            self.emit(ProgressEvent::Skipped {
                index,
                total,
                filename: item.filename.clone(),
            });
            return Some(ItemRecord {
                id,
                outcome: TransferOutcome::Skipped {
                    existing_size: snapshot.size_of(&item.filename),
                },
                filename: item.filename,
            });
        }

        let outcome = self.transfer(index, total, &item, downloader, relocator)?;
        Some(ItemRecord {
            id,
            filename: item.filename,
            outcome,
        })
    }

    /// Download and relocate, re-processing the item when the storage tree
    /// reports a transient failure.
    fn transfer(
        &mut self,
        index: usize,
        total: usize,
        item: &Item,
        downloader: &Downloader<'_, F>,
        relocator: &Relocator<'_>,
    ) -> Option<TransferOutcome> {
        let policy = self.config.run_retry;
        let mut pass = 0u32;
        loop {
            pass += 1;
            self.emit(ProgressEvent::Downloading {
                index,
                total,
                filename: item.filename.clone(),
                size: item.declared_size,
            });

            let staged = match downloader.fetch(item, &self.config.staging_dir) {
                Ok(path) => path,
                Err(e) if e.is_cancelled() => {
                    tracing::info!(
                        "[{}/{}] {} interrupted by cancellation",
                        index,
                        total,
                        item.filename
                    );
                    return None;
                }
                Err(e) => {
                    let reason = e.reason();
                    return Some(self.fail(index, total, &item.filename, FailureStage::Download, reason));
                }
            };

            self.emit(ProgressEvent::Uploading {
                index,
                total,
                filename: item.filename.clone(),
            });

            let relocated =
                relocator.relocate(&staged, &self.config.destination_dir, &item.filename);
            let err = match relocated {
                Ok(relocated) => {
                    self.stats.downloaded += 1;
                    self.stats.total_bytes += relocated.size;
                    self.emit(ProgressEvent::Completed {
                        index,
                        total,
                        filename: item.filename.clone(),
                        size: relocated.size,
                    });
                    return Some(TransferOutcome::Completed {
                        bytes: relocated.size,
                        path: relocated.path,
                    });
                }
                Err(e) => e,
            };

            remove_staged(&staged);
            let kind = match err.transient_kind() {
                Some(kind) if pass < policy.max_passes.max(1) => kind,
                _ => return Some(self.fail_upload(index, total, item, &err)),
            };

            let delay = policy.delay_for(kind);
            tracing::warn!(
                "[{}/{}] {}: {} error while relocating ({}), re-processing in {}s (pass {}/{})",
                index,
                total,
                item.filename,
                kind.label(),
                err,
                delay.as_secs(),
                pass,
                policy.max_passes
            );
            if !sleep_or_cancel(self.cancel, delay) {
                return None;
            }
        }
    }

    fn fail_upload(
        &mut self,
        index: usize,
        total: usize,
        item: &Item,
        err: &RelocateError,
    ) -> TransferOutcome {
        self.fail(index, total, &item.filename, FailureStage::Upload, err.to_string())
    }

    fn fail(
        &mut self,
        index: usize,
        total: usize,
        filename: &str,
        stage: FailureStage,
        reason: String,
    ) -> TransferOutcome {
        self.stats.failed += 1;
        self.emit(ProgressEvent::Failed {
            index,
            total,
            filename: filename.to_string(),
            stage,
            reason: reason.clone(),
        });
        TransferOutcome::Failed { stage, reason }
    }

    fn emit(&self, event: ProgressEvent) {
        self.sink.event(&event, &self.stats);
    }
}

fn remove_staged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Could not remove staged file {}: {}", path.display(), e);
        }
    }
}

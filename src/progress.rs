//! Progress event stream consumed by front ends.
//!
//! The pipeline never renders anything itself. It reports item-level events
//! (with a read-only snapshot of the run's statistics) and informational
//! transfer observations to a [`ProgressSink`] owned by the front end.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::mirror::{FailureStage, RunStats};

/// Item-level events, emitted in item order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Started {
        total: usize,
    },
    Skipped {
        index: usize,
        total: usize,
        filename: String,
    },
    Downloading {
        index: usize,
        total: usize,
        filename: String,
        size: Option<u64>,
    },
    Uploading {
        index: usize,
        total: usize,
        filename: String,
    },
    Completed {
        index: usize,
        total: usize,
        filename: String,
        size: u64,
    },
    Failed {
        index: usize,
        total: usize,
        filename: String,
        stage: FailureStage,
        reason: String,
    },
    Error {
        message: String,
    },
    Finished {
        total: usize,
        downloaded: u64,
        skipped: u64,
        failed: u64,
        total_bytes: u64,
    },
}

impl ProgressEvent {
    /// Whether this event resolves an item (skipped, completed or failed).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Skipped { .. }
                | ProgressEvent::Completed { .. }
                | ProgressEvent::Failed { .. }
        )
    }
}

/// Which observer produced a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverSource {
    /// The transport's own progress callback.
    Callback,
    /// The staging-file polling monitor.
    Monitor,
}

/// Informational observations about the transfer in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferObservation {
    Bytes {
        received: u64,
        total: Option<u64>,
        source: ObserverSource,
    },
    /// The staging file has not been created yet.
    WaitingForStart { elapsed: Duration },
    /// The start window passed without a staging file: likely an API-level hang.
    NotStarted { elapsed: Duration },
    /// No growth across several consecutive polls.
    Stalled {
        size: u64,
        total: u64,
        elapsed: Duration,
    },
    NearlyComplete { size: u64, total: u64 },
    /// Bytes on disk when an attempt timed out.
    Partial { size: u64, total: Option<u64> },
}

/// Receiver of the pipeline's progress stream. Implementations must be
/// cheap: they are called synchronously from the pipeline, and
/// [`ProgressSink::transfer`] also from the stall monitor thread.
pub trait ProgressSink: Sync {
    fn event(&self, event: &ProgressEvent, stats: &RunStats);

    fn transfer(&self, _filename: &str, _observation: &TransferObservation) {}
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: &ProgressEvent, _stats: &RunStats) {
        match event {
            ProgressEvent::Started { total } => tracing::info!("Mirroring {} items", total),
            ProgressEvent::Skipped {
                index,
                total,
                filename,
            } => tracing::info!("[{}/{}] skipped (already exists): {}", index, total, filename),
            ProgressEvent::Downloading {
                index,
                total,
                filename,
                size,
            } => tracing::info!(
                "[{}/{}] downloading {} ({})",
                index,
                total,
                filename,
                format_size(*size)
            ),
            ProgressEvent::Uploading {
                index,
                total,
                filename,
            } => tracing::debug!("[{}/{}] relocating {}", index, total, filename),
            ProgressEvent::Completed {
                index,
                total,
                filename,
                size,
            } => tracing::info!(
                "[{}/{}] completed {} ({})",
                index,
                total,
                filename,
                format_size(Some(*size))
            ),
            ProgressEvent::Failed {
                index,
                total,
                filename,
                stage,
                reason,
            } => tracing::error!("[{}/{}] {} failed ({}): {}", index, total, filename, stage, reason),
            ProgressEvent::Error { message } => tracing::error!("{}", message),
            ProgressEvent::Finished {
                total,
                downloaded,
                skipped,
                failed,
                total_bytes,
            } => tracing::info!(
                "Finished {} items: {} downloaded, {} skipped, {} failed, {}",
                total,
                downloaded,
                skipped,
                failed,
                format_size(Some(*total_bytes))
            ),
        }
    }

    fn transfer(&self, filename: &str, observation: &TransferObservation) {
        match observation {
            TransferObservation::Bytes { .. } => {}
            other => tracing::debug!("{}: {:?}", filename, other),
        }
    }
}

/// What a [`ChannelSink`] forwards to the host.
#[derive(Debug, Clone)]
pub enum ProgressUpdate {
    Event {
        event: ProgressEvent,
        stats: RunStats,
    },
    Transfer {
        filename: String,
        observation: TransferObservation,
    },
}

/// Bridges the blocking pipeline to an async host by message passing.
///
/// A closed receiver is ignored: the pipeline keeps running even if nobody
/// is listening.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<ProgressUpdate>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<ProgressUpdate>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn event(&self, event: &ProgressEvent, stats: &RunStats) {
        let _ = self.tx.send(ProgressUpdate::Event {
            event: event.clone(),
            stats: stats.clone(),
        });
    }

    fn transfer(&self, filename: &str, observation: &TransferObservation) {
        let _ = self.tx.send(ProgressUpdate::Transfer {
            filename: filename.to_string(),
            observation: observation.clone(),
        });
    }
}

/// Human-readable size with two decimals, `"Unknown"` when absent.
pub fn format_size(size: Option<u64>) -> String {
    let Some(bytes) = size else {
        return "Unknown".to_string();
    };
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} PB", value)
}

pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

//! Polling observer for a transfer in flight.
//!
//! Runs beside the transport's own progress callback, which may silently
//! stop firing. It only reads the staging file's metadata and reports; it
//! never retries or touches transfer state.

use std::fs;
use std::path::Path;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::progress::{ObserverSource, ProgressSink, TransferObservation};

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// How long the staging file may take to appear.
    pub start_window: Duration,
    /// Consecutive polls without growth before a stall is reported.
    pub stall_polls: u32,
    /// Fraction of the declared size treated as done.
    pub completion_ratio: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            start_window: Duration::from_secs(60),
            stall_polls: 3,
            completion_ratio: 0.99,
        }
    }
}

/// What the monitor saw before it stopped.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub not_started: bool,
    pub stalls: u32,
    pub completed: bool,
    pub last_size: u64,
}

pub(crate) struct StallMonitor<'a> {
    pub path: &'a Path,
    pub filename: &'a str,
    /// Declared size, 0 when unknown.
    pub total: u64,
    pub config: &'a MonitorConfig,
    pub sink: &'a dyn ProgressSink,
    pub cancel: &'a CancellationToken,
}

impl StallMonitor<'_> {
    /// Poll until `stop` fires or disconnects, the run is cancelled, or the
    /// file reaches the completion ratio.
    pub fn run(&self, stop: Receiver<()>) -> MonitorReport {
        let started = Instant::now();
        let mut report = MonitorReport::default();

        while !self.path.exists() {
            let elapsed = started.elapsed();
            if elapsed >= self.config.start_window {
                tracing::warn!(
                    "{}: no data after {}s, transfer may be stuck upstream",
                    self.filename,
                    elapsed.as_secs()
                );
                self.report(&TransferObservation::NotStarted { elapsed });
                report.not_started = true;
                break;
            }
            self.report(&TransferObservation::WaitingForStart { elapsed });
            if self.should_stop(&stop) {
                return report;
            }
        }

        let mut stalled_polls = 0u32;
        loop {
            if self.should_stop(&stop) {
                return report;
            }
            // Missing file: not created yet, or removed by a retry
            let Ok(meta) = fs::metadata(self.path) else {
                continue;
            };
            let size = meta.len();
            if size > report.last_size {
                report.last_size = size;
                stalled_polls = 0;
                self.report(&TransferObservation::Bytes {
                    received: size,
                    total: (self.total > 0).then_some(self.total),
                    source: ObserverSource::Monitor,
                });
            } else {
                stalled_polls += 1;
                if stalled_polls >= self.config.stall_polls {
                    let elapsed = started.elapsed();
                    tracing::warn!(
                        "{}: stalled at {} of {} bytes ({}s elapsed)",
                        self.filename,
                        size,
                        self.total,
                        elapsed.as_secs()
                    );
                    self.report(&TransferObservation::Stalled {
                        size,
                        total: self.total,
                        elapsed,
                    });
                    report.stalls += 1;
                    stalled_polls = 0;
                }
            }

            if self.total > 0 && size as f64 >= self.total as f64 * self.config.completion_ratio {
                self.report(&TransferObservation::NearlyComplete {
                    size,
                    total: self.total,
                });
                report.completed = true;
                return report;
            }
        }
    }

    /// Sleep one poll interval; true when the monitor should exit.
    fn should_stop(&self, stop: &Receiver<()>) -> bool {
        match stop.recv_timeout(self.config.poll_interval) {
            Err(RecvTimeoutError::Timeout) => self.cancel.is_cancelled(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    fn report(&self, observation: &TransferObservation) {
        self.sink.transfer(self.filename, observation);
    }
}

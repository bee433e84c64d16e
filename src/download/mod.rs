//! Retrying downloader: transfers one item's media into the staging area.
//!
//! Each attempt starts from an empty staging file with a size-proportional
//! deadline. Rate limits wait exactly as long as upstream asks without using
//! up an attempt; timeouts cool down and widen the deadline; connection
//! errors back off progressively. Large transfers get a second, polling
//! observer ([`monitor`]) next to the transport's own progress callback.

pub mod error;
pub mod monitor;
pub mod paths;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use tokio_util::sync::CancellationToken;

use crate::feed::{DownloadRequest, FeedClient, FeedError, ProgressFn};
use crate::media::Item;
use crate::progress::{ObserverSource, ProgressSink, TransferObservation};
use crate::retry::{FailureKind, RetryPolicy};
use crate::shutdown::sleep_or_cancel;

pub use error::FetchError;
pub use monitor::MonitorConfig;

/// Downloader settings. Decoupled from CLI parsing so it can be tested alone.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub retry: RetryPolicy,
    /// Items larger than this get both progress observers.
    pub large_file_threshold: u64,
    pub monitor: MonitorConfig,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            large_file_threshold: 50 * 1024 * 1024,
            monitor: MonitorConfig::default(),
        }
    }
}

pub struct Downloader<'a, F: FeedClient + ?Sized> {
    feed: &'a F,
    config: &'a TransferConfig,
    sink: &'a dyn ProgressSink,
    cancel: &'a CancellationToken,
}

impl<'a, F: FeedClient + ?Sized> Downloader<'a, F> {
    pub fn new(
        feed: &'a F,
        config: &'a TransferConfig,
        sink: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            feed,
            config,
            sink,
            cancel,
        }
    }

    /// Download `item` into a fresh conflict-free path under `staging_dir`.
    ///
    /// On failure the staging file is removed; the monitor thread (if any)
    /// has always been joined by the time this returns.
    pub fn fetch(&self, item: &Item, staging_dir: &Path) -> Result<PathBuf, FetchError> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let staged = paths::staging_path(staging_dir, &item.filename);
        let observe = item
            .declared_size
            .is_some_and(|size| size > self.config.large_file_threshold);
        let mut timeout = policy.timeout.initial(item.declared_size);
        let mut attempts = 0u32;

        tracing::debug!(
            path = %staged.display(),
            timeout_secs = timeout.as_secs(),
            observe,
            "staging download",
        );

        loop {
            if self.cancel.is_cancelled() {
                remove_partial(&staged);
                return Err(FetchError::Cancelled);
            }
            remove_partial(&staged);

            let result = self
                .attempt(item, &staged, timeout, observe)
                .and_then(|path| check_length(item, path));
            let err = match result {
                Ok(path) => return self.check_result(path, &staged),
                Err(e) => e,
            };

            let kind = err.kind();
            if kind.consumes_attempt() {
                attempts += 1;
            }

            match kind {
                FailureKind::RateLimited(_) => {
                    tracing::warn!(
                        "{}: rate limited, waiting {}s before retrying",
                        item.filename,
                        policy.delay_for(kind, attempts).as_secs()
                    );
                }
                FailureKind::Timeout => self.report_partial(item, &staged, &err),
                _ => {}
            }

            if kind.consumes_attempt() && attempts >= max_attempts {
                tracing::error!(
                    "{}: download failed after {} attempts: {}",
                    item.filename,
                    attempts,
                    err
                );
                remove_partial(&staged);
                return Err(FetchError::Exhausted {
                    kind,
                    attempts,
                    last_error: err.to_string(),
                });
            }

            let delay = policy.delay_for(kind, attempts);
            if kind.consumes_attempt() {
                tracing::warn!(
                    "{}: {} error (attempt {}/{}), retrying in {}s: {}",
                    item.filename,
                    kind.label(),
                    attempts,
                    max_attempts,
                    delay.as_secs(),
                    err
                );
            }
            if !sleep_or_cancel(self.cancel, delay) {
                remove_partial(&staged);
                return Err(FetchError::Cancelled);
            }
            if kind == FailureKind::Timeout {
                timeout = policy.timeout.grow(timeout);
                tracing::debug!("{}: timeout raised to {}s", item.filename, timeout.as_secs());
            }
        }
    }

    /// One transfer attempt, with both observers running for large items.
    fn attempt(
        &self,
        item: &Item,
        staged: &Path,
        timeout: std::time::Duration,
        observe: bool,
    ) -> Result<PathBuf, FeedError> {
        let callback = |received: u64, total: Option<u64>| {
            self.sink.transfer(
                &item.filename,
                &TransferObservation::Bytes {
                    received,
                    total,
                    source: ObserverSource::Callback,
                },
            );
        };
        let progress = if observe {
            Some(&callback as ProgressFn<'_>)
        } else {
            None
        };
        let request = DownloadRequest {
            message: &item.message,
            dest: staged,
            timeout,
            progress,
        };

        if !observe {
            return self.feed.download(&request);
        }

        std::thread::scope(|scope| {
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let monitor = monitor::StallMonitor {
                path: staged,
                filename: &item.filename,
                total: item.declared_size.unwrap_or(0),
                config: &self.config.monitor,
                sink: self.sink,
                cancel: self.cancel,
            };
            let handle = scope.spawn(move || monitor.run(stop_rx));

            let result = self.feed.download(&request);

            drop(stop_tx);
            match handle.join() {
                Ok(report) if report.not_started || report.stalls > 0 => tracing::debug!(
                    not_started = report.not_started,
                    stalls = report.stalls,
                    last_size = report.last_size,
                    "{}: transfer was unhealthy while observed",
                    item.filename
                ),
                Ok(report) => tracing::debug!(
                    completed = report.completed,
                    last_size = report.last_size,
                    "{}: monitor stopped",
                    item.filename
                ),
                Err(_) => tracing::warn!("{}: stall monitor panicked", item.filename),
            }
            result
        })
    }

    /// A present-but-empty result is not a successful download. Length
    /// disagreements are caught earlier by [`check_length`] and retried.
    fn check_result(&self, path: PathBuf, staged: &Path) -> Result<PathBuf, FetchError> {
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(path),
            _ => {
                tracing::error!("Download produced no data at {}", path.display());
                remove_partial(&path);
                remove_partial(staged);
                Err(FetchError::Empty(path))
            }
        }
    }

    fn report_partial(&self, item: &Item, staged: &Path, err: &FeedError) {
        let size = fs::metadata(staged).map(|m| m.len()).unwrap_or(0);
        if size > 0 {
            tracing::warn!(
                "{}: {} with {} of {:?} bytes on disk",
                item.filename,
                err,
                size,
                item.declared_size
            );
            self.sink.transfer(
                &item.filename,
                &TransferObservation::Partial {
                    size,
                    total: item.declared_size,
                },
            );
        } else {
            tracing::warn!("{}: {} before any data arrived", item.filename, err);
        }
    }
}

/// A non-empty file whose length differs from the declared size means the body
/// ended early (or overran) without a transport error.
fn check_length(item: &Item, path: PathBuf) -> Result<PathBuf, FeedError> {
    let Some(declared) = item.declared_size else {
        return Ok(path);
    };
    let actual = match fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(path),
    };
    if actual == 0 || actual == declared {
        return Ok(path);
    }
    Err(FeedError::Other(format!(
        "short download: {} of {} bytes",
        actual, declared
    )))
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove partial file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::TimeoutPolicy;
    use crate::testutil::{document_message, fast_transfer_config, FakeFeed, RecordingSink, Step};
    use std::time::{Duration, Instant};

    fn item(id: i64, size: u64) -> Item {
        let message = document_message(id, &format!("file{}.bin", id), size);
        let info = crate::media::extract(&message).unwrap();
        Item::new(message, info)
    }

    #[test]
    fn test_clean_download() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let path = downloader.fetch(&item(1, 64), staging.path()).unwrap();
        assert_eq!(path, staging.path().join("file1.bin"));
        assert_eq!(fs::metadata(&path).unwrap().len(), 64);
        assert_eq!(feed.download_calls(1), 1);
    }

    #[test]
    fn test_staging_conflict_gets_suffix() {
        let staging = tempfile::tempdir().unwrap();
        fs::write(staging.path().join("file1.bin"), b"leftover").unwrap();
        let feed = FakeFeed::new(vec![]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let path = downloader.fetch(&item(1, 8), staging.path()).unwrap();
        assert_eq!(path, staging.path().join("file1_1.bin"));
    }

    #[test]
    fn test_rate_limit_waits_and_does_not_consume_attempts() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(
            1,
            vec![
                Step::RateLimited(Duration::from_secs(1)),
                Step::RateLimited(Duration::from_millis(10)),
                Step::RateLimited(Duration::from_millis(10)),
                Step::Data,
            ],
        );
        let config = TransferConfig {
            retry: RetryPolicy {
                max_attempts: 1,
                ..fast_transfer_config().retry
            },
            ..fast_transfer_config()
        };
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let started = Instant::now();
        let path = downloader.fetch(&item(1, 32), staging.path()).unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(fs::metadata(path).unwrap().len(), 32);
        assert_eq!(feed.download_calls(1), 4);
    }

    #[test]
    fn test_connection_errors_exhaust_attempts() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(1, vec![Step::Connection]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let err = downloader.fetch(&item(1, 32), staging.path()).unwrap_err();
        match err {
            FetchError::Exhausted { kind, attempts, .. } => {
                assert_eq!(kind, FailureKind::Connection);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(feed.download_calls(1), 3);
        assert!(fs::read_dir(staging.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_transient_then_success() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(1, vec![Step::Other, Step::Connection, Step::Data]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        assert!(downloader.fetch(&item(1, 16), staging.path()).is_ok());
        assert_eq!(feed.download_calls(1), 3);
    }

    #[test]
    fn test_timeout_grows_deadline_and_reports_partial() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(1, vec![Step::PartialTimeout(5)]);
        let config = TransferConfig {
            retry: RetryPolicy {
                timeout: TimeoutPolicy {
                    per_gib: Duration::from_secs(600),
                    min: Duration::from_secs(100),
                    max: Duration::from_secs(1000),
                    unknown_size: Duration::from_secs(100),
                    growth: 1.5,
                },
                ..fast_transfer_config().retry
            },
            ..fast_transfer_config()
        };
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let err = downloader.fetch(&item(1, 32), staging.path()).unwrap_err();
        assert!(matches!(
            err,
            FetchError::Exhausted {
                kind: FailureKind::Timeout,
                ..
            }
        ));
        assert_eq!(
            feed.timeouts(1),
            vec![
                Duration::from_secs(100),
                Duration::from_secs(150),
                Duration::from_secs(225)
            ]
        );
        assert!(sink
            .observations()
            .iter()
            .any(|o| matches!(o, TransferObservation::Partial { size: 5, .. })));
        assert!(!staging.path().join("file1.bin").exists());
    }

    #[test]
    fn test_empty_result_is_failure() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(1, vec![Step::Empty]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let err = downloader.fetch(&item(1, 16), staging.path()).unwrap_err();
        assert!(matches!(err, FetchError::Empty(_)));
        assert!(!staging.path().join("file1.bin").exists());
    }

    #[test]
    fn test_short_download_is_retried_then_fails() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(1, vec![Step::Short(500)]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let err = downloader.fetch(&item(1, 1000), staging.path()).unwrap_err();
        match &err {
            FetchError::Exhausted {
                kind,
                attempts,
                last_error,
            } => {
                assert_eq!(*kind, FailureKind::Other);
                assert_eq!(*attempts, 3);
                assert!(last_error.contains("500 of 1000"), "{}", last_error);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(feed.download_calls(1), 3);
        assert!(fs::read_dir(staging.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_short_download_recovers_on_full_body() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(1, vec![Step::Short(10), Step::Data]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let path = downloader.fetch(&item(1, 64), staging.path()).unwrap();
        assert_eq!(fs::metadata(path).unwrap().len(), 64);
        assert_eq!(feed.download_calls(1), 2);
    }

    #[test]
    fn test_zero_rate_limit_wait_still_pauses() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(
            1,
            vec![
                Step::RateLimited(Duration::ZERO),
                Step::RateLimited(Duration::ZERO),
                Step::Data,
            ],
        );
        let config = TransferConfig {
            retry: RetryPolicy {
                min_rate_limit_wait: Duration::from_millis(50),
                ..fast_transfer_config().retry
            },
            ..fast_transfer_config()
        };
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let started = Instant::now();
        downloader.fetch(&item(1, 8), staging.path()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(feed.download_calls(1), 3);
    }

    #[test]
    fn test_cancel_during_backoff() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        feed.script(1, vec![Step::RateLimited(Duration::from_secs(3600))]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.cancel();
        });
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        let started = Instant::now();
        let err = downloader.fetch(&item(1, 16), staging.path()).unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(10));
        canceller.join().unwrap();
    }

    #[test]
    fn test_large_item_gets_both_observers() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        let config = TransferConfig {
            large_file_threshold: 100,
            ..fast_transfer_config()
        };
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        downloader.fetch(&item(1, 4096), staging.path()).unwrap();
        assert!(sink.observations().iter().any(|o| matches!(
            o,
            TransferObservation::Bytes {
                source: ObserverSource::Callback,
                ..
            }
        )));
    }

    #[test]
    fn test_small_item_has_no_callback() {
        let staging = tempfile::tempdir().unwrap();
        let feed = FakeFeed::new(vec![]);
        let config = fast_transfer_config();
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let downloader = Downloader::new(&feed, &config, &sink, &cancel);

        downloader.fetch(&item(1, 16), staging.path()).unwrap();
        assert!(sink.observations().is_empty());
    }
}

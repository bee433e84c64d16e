//! Scripted fakes shared by the pipeline's unit tests.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::download::{MonitorConfig, TransferConfig};
use crate::feed::{
    Channel, ChannelIdentity, DownloadRequest, FeedClient, FeedError, FeedMessage, Media,
    MessageIter,
};
use crate::mirror::RunStats;
use crate::progress::{ProgressEvent, ProgressSink, TransferObservation};
use crate::retry::{RetryPolicy, TimeoutPolicy};
use crate::storage::{LocalStorage, Storage, StorageError};
use crate::types::EnumerationOrder;

pub fn document_message(id: i64, file_name: &str, size: u64) -> FeedMessage {
    FeedMessage {
        id,
        channel_id: 77,
        media: Some(Media::Document {
            id: id * 100,
            file_name: Some(file_name.to_string()),
            mime_type: None,
            size,
        }),
    }
}

pub fn text_message(id: i64) -> FeedMessage {
    FeedMessage {
        id,
        channel_id: 77,
        media: None,
    }
}

/// Millisecond delays so retry paths run quickly.
pub fn fast_transfer_config() -> TransferConfig {
    TransferConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            timeout_cooldown: Duration::from_millis(10),
            connection_base_delay: Duration::from_millis(10),
            other_delay: Duration::from_millis(10),
            min_rate_limit_wait: Duration::from_millis(5),
            timeout: TimeoutPolicy::default(),
        },
        large_file_threshold: 50 * 1024 * 1024,
        monitor: MonitorConfig {
            poll_interval: Duration::from_millis(10),
            start_window: Duration::from_millis(200),
            stall_polls: 3,
            completion_ratio: 0.99,
        },
    }
}

/// What one scripted download call does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write the declared size of deterministic bytes.
    Data,
    RateLimited(Duration),
    /// Write this many bytes, then time out.
    PartialTimeout(u64),
    Connection,
    Other,
    /// Write an empty file and report success.
    Empty,
    /// Write only the first N bytes of the payload and report success.
    Short(u64),
}

/// In-memory feed. Messages are given newest first; per-message scripts are
/// consumed one step per download call and the last step repeats.
pub struct FakeFeed {
    channel: Channel,
    messages: Vec<FeedMessage>,
    scripts: Mutex<HashMap<i64, Vec<Step>>>,
    calls: Mutex<Vec<(i64, Duration)>>,
    unreachable: bool,
    missing: bool,
}

impl FakeFeed {
    pub fn new(messages: Vec<FeedMessage>) -> Self {
        Self {
            channel: Channel {
                id: 77,
                title: "Test Channel".to_string(),
                username: Some("@test".to_string()),
            },
            messages,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            unreachable: false,
            missing: false,
        }
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn missing(mut self) -> Self {
        self.missing = true;
        self
    }

    pub fn script(&self, id: i64, steps: Vec<Step>) {
        self.scripts.lock().unwrap().insert(id, steps);
    }

    pub fn download_calls(&self, id: i64) -> usize {
        self.calls.lock().unwrap().iter().filter(|(m, _)| *m == id).count()
    }

    pub fn total_download_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Deadline handed to each download call for `id`, in order.
    pub fn timeouts(&self, id: i64) -> Vec<Duration> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| *m == id)
            .map(|(_, t)| *t)
            .collect()
    }

    fn next_step(&self, id: i64) -> Step {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&id) {
            Some(steps) if steps.len() > 1 => steps.remove(0),
            Some(steps) => steps.first().cloned().unwrap_or(Step::Data),
            None => Step::Data,
        }
    }
}

/// Deterministic payload for a message, so tests can compare contents.
pub fn payload(message: &FeedMessage) -> Vec<u8> {
    let size = match &message.media {
        Some(Media::Document { size, .. }) => *size,
        Some(Media::Photo { size, .. }) => size.unwrap_or(16),
        _ => 0,
    };
    (0..size).map(|i| (message.id as u64 + i) as u8).collect()
}

impl FeedClient for FakeFeed {
    fn list_channels(&self) -> Result<Vec<Channel>, FeedError> {
        Ok(vec![self.channel.clone()])
    }

    fn resolve(&self, identity: &ChannelIdentity) -> Result<Channel, FeedError> {
        if self.unreachable {
            return Err(FeedError::Connection("network unreachable".into()));
        }
        if self.missing {
            return Err(FeedError::NotFound(identity.to_string()));
        }
        Ok(self.channel.clone())
    }

    fn iterate<'a>(
        &'a self,
        _channel: &Channel,
        order: EnumerationOrder,
    ) -> Result<MessageIter<'a>, FeedError> {
        let iter = self
            .messages
            .iter()
            .cloned()
            .map(Ok::<FeedMessage, FeedError>);
        let iter: MessageIter<'a> = if order.is_reversed() {
            Box::new(iter.rev())
        } else {
            Box::new(iter)
        };
        Ok(iter)
    }

    fn download(&self, request: &DownloadRequest<'_>) -> Result<PathBuf, FeedError> {
        let id = request.message.id;
        self.calls.lock().unwrap().push((id, request.timeout));
        match self.next_step(id) {
            Step::Data => {
                let data = payload(request.message);
                let total = Some(data.len() as u64);
                if let Some(progress) = request.progress {
                    progress(0, total);
                }
                fs::write(request.dest, &data)?;
                if let Some(progress) = request.progress {
                    progress(data.len() as u64, total);
                }
                Ok(request.dest.to_path_buf())
            }
            Step::RateLimited(wait) => Err(FeedError::RateLimited { wait }),
            Step::PartialTimeout(bytes) => {
                fs::write(request.dest, vec![0u8; bytes as usize])?;
                Err(FeedError::Timeout(request.timeout))
            }
            Step::Connection => Err(FeedError::Connection("connection reset by peer".into())),
            Step::Other => Err(FeedError::Other("HTTP 500".into())),
            Step::Empty => {
                fs::write(request.dest, b"")?;
                Ok(request.dest.to_path_buf())
            }
            Step::Short(bytes) => {
                let mut data = payload(request.message);
                data.truncate(bytes as usize);
                fs::write(request.dest, &data)?;
                Ok(request.dest.to_path_buf())
            }
        }
    }
}

/// Sink that records everything and can cancel the run after N resolved items.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
    stats: Mutex<Vec<RunStats>>,
    observations: Mutex<Vec<TransferObservation>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingSink {
    pub fn cancelling_after(resolved: usize, token: CancellationToken) -> Self {
        Self {
            cancel_after: Some((resolved, token)),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn terminal_events(&self) -> Vec<ProgressEvent> {
        self.events().into_iter().filter(|e| e.is_terminal()).collect()
    }

    /// Stats snapshot delivered with each event.
    pub fn stats(&self) -> Vec<RunStats> {
        self.stats.lock().unwrap().clone()
    }

    pub fn observations(&self) -> Vec<TransferObservation> {
        self.observations.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn event(&self, event: &ProgressEvent, stats: &RunStats) {
        let resolved = {
            let mut events = self.events.lock().unwrap();
            events.push(event.clone());
            events.iter().filter(|e| e.is_terminal()).count()
        };
        self.stats.lock().unwrap().push(stats.clone());
        if let Some((after, token)) = &self.cancel_after {
            if event.is_terminal() && resolved >= *after {
                token.cancel();
            }
        }
    }

    fn transfer(&self, _filename: &str, observation: &TransferObservation) {
        self.observations.lock().unwrap().push(observation.clone());
    }
}

/// Local storage that misbehaves on demand.
#[derive(Default)]
pub struct FlakyStorage {
    inner: LocalStorage,
    /// Remaining moves that fail with a timeout before touching anything.
    failing_moves: AtomicU32,
    truncate: bool,
    corrupt: bool,
    /// Every move writes half the bytes to the destination, then fails.
    partial: Option<std::io::ErrorKind>,
}

impl FlakyStorage {
    pub fn failing_moves(count: u32) -> Self {
        Self {
            failing_moves: AtomicU32::new(count),
            ..Self::default()
        }
    }

    /// Every moved file loses its last byte.
    pub fn truncating() -> Self {
        Self {
            truncate: true,
            ..Self::default()
        }
    }

    /// Every move leaves half the file at the destination and then fails
    /// with `kind`, like a copy interrupted by a full or dropped drive.
    pub fn partial_moves(kind: std::io::ErrorKind) -> Self {
        Self {
            partial: Some(kind),
            ..Self::default()
        }
    }

    /// Every moved file has its first byte flipped.
    pub fn corrupting() -> Self {
        Self {
            corrupt: true,
            ..Self::default()
        }
    }
}

impl Storage for FlakyStorage {
    fn ensure_dir(&self, dir: &Path) -> Result<(), StorageError> {
        self.inner.ensure_dir(dir)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<(String, u64)>, StorageError> {
        self.inner.list_files(dir)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn file_size(&self, path: &Path) -> Result<u64, StorageError> {
        self.inner.file_size(path)
    }

    fn move_file(&self, from: &Path, to: &Path) -> Result<(), StorageError> {
        let pending = self.failing_moves.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_moves.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::io(
                "move",
                to,
                std::io::Error::from(std::io::ErrorKind::TimedOut),
            ));
        }
        if let Some(kind) = self.partial {
            let data = fs::read(from).map_err(|e| StorageError::io("read", from, e))?;
            fs::write(to, &data[..data.len() / 2]).map_err(|e| StorageError::io("write", to, e))?;
            return Err(StorageError::io("copy", to, std::io::Error::from(kind)));
        }
        self.inner.move_file(from, to)?;
        if self.truncate || self.corrupt {
            let mut data = fs::read(to).map_err(|e| StorageError::io("read", to, e))?;
            if self.truncate {
                data.pop();
            }
            if self.corrupt {
                if let Some(first) = data.first_mut() {
                    *first ^= 0xff;
                }
            }
            fs::write(to, data).map_err(|e| StorageError::io("write", to, e))?;
        }
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> Result<(), StorageError> {
        self.inner.delete_file(path)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + '_>, StorageError> {
        self.inner.open(path)
    }
}

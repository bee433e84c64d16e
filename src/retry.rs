//! Retry classification and backoff policy for item transfers.
//!
//! The downloader retries per [`FailureKind`]: rate limits wait exactly as long
//! as upstream asks, timeouts cool down and widen the deadline, connection
//! errors back off progressively, anything else backs off briefly.

use std::time::Duration;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Floor for upstream rate-limit waits; a zero `Retry-After` would otherwise
/// spin against the feed.
pub const MIN_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Transient failure classes shared by the feed client and the storage tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Upstream demanded an exact cooldown before the next request.
    RateLimited(Duration),
    Timeout,
    Connection,
    Other,
}

impl FailureKind {
    /// Short label used in failure reasons and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::RateLimited(_) => "rate-limited",
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::Other => "other",
        }
    }

    /// Rate limits are retried without consuming an attempt.
    pub fn consumes_attempt(&self) -> bool {
        !matches!(self, FailureKind::RateLimited(_))
    }
}

/// Size-proportional transfer deadline.
///
/// `timeout = clamp(size_gib * per_gib, min, max)`, or `unknown_size` when the
/// feed did not declare a size. A fixed deadline starves large transfers and
/// an unbounded one hangs forever on a dead connection.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    pub per_gib: Duration,
    pub min: Duration,
    pub max: Duration,
    pub unknown_size: Duration,
    /// Multiplier applied to the deadline after each timed-out attempt.
    pub growth: f64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            per_gib: Duration::from_secs(600),
            min: Duration::from_secs(900),
            max: Duration::from_secs(3 * 3600),
            unknown_size: Duration::from_secs(3600),
            growth: 1.2,
        }
    }
}

impl TimeoutPolicy {
    /// Deadline for the first attempt on an item of `size` bytes.
    pub fn initial(&self, size: Option<u64>) -> Duration {
        match size {
            Some(bytes) => {
                let secs = bytes as f64 / GIB * self.per_gib.as_secs_f64();
                Duration::from_secs_f64(secs).clamp(self.min, self.max)
            }
            None => self.unknown_size,
        }
    }

    /// Deadline for the attempt following a timeout.
    pub fn grow(&self, current: Duration) -> Duration {
        current.mul_f64(self.growth.max(1.0))
    }
}

/// Per-item retry budget and backoff delays.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per item, counting the first one. Rate limits don't count.
    pub max_attempts: u32,
    pub timeout_cooldown: Duration,
    pub connection_base_delay: Duration,
    pub other_delay: Duration,
    /// Rate-limit waits shorter than this are raised to it.
    pub min_rate_limit_wait: Duration,
    pub timeout: TimeoutPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_cooldown: Duration::from_secs(30),
            connection_base_delay: Duration::from_secs(10),
            other_delay: Duration::from_secs(5),
            min_rate_limit_wait: MIN_RATE_LIMIT_WAIT,
            timeout: TimeoutPolicy::default(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th (1-based) failure.
    ///
    /// Connection errors back off as `attempt * connection_base_delay`.
    pub fn delay_for(&self, kind: FailureKind, attempt: u32) -> Duration {
        match kind {
            FailureKind::RateLimited(wait) => wait.max(self.min_rate_limit_wait),
            FailureKind::Timeout => self.timeout_cooldown,
            FailureKind::Connection => self.connection_base_delay.saturating_mul(attempt.max(1)),
            FailureKind::Other => self.other_delay,
        }
    }
}

/// Run-level safety net above the downloader's own retries: a transient
/// signal escaping an item's steps cools down and re-processes the same item.
#[derive(Debug, Clone, Copy)]
pub struct RunRetryPolicy {
    /// Cooldown for connection and timeout signals. Rate limits use the
    /// upstream wait instead.
    pub cooldown: Duration,
    /// How many times one item may be re-processed before it is recorded as
    /// failed. Independent of [`RetryPolicy::max_attempts`].
    pub max_passes: u32,
}

impl Default for RunRetryPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            max_passes: 5,
        }
    }
}

impl RunRetryPolicy {
    pub fn delay_for(&self, kind: FailureKind) -> Duration {
        match kind {
            FailureKind::RateLimited(wait) => wait.max(MIN_RATE_LIMIT_WAIT),
            _ => self.cooldown,
        }
    }
}

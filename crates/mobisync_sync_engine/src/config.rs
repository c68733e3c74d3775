//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use std::time::Duration;

/// Default page size for pulls.
pub const DEFAULT_MAX_PAGE_SIZE: u64 = 50;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum rows requested per pull page.
    pub max_page_size: u64,
    /// Whether incremental pulls order by `updatedAt` and advance the delta
    /// token page by page.
    pub ordered_incremental_pull: bool,
    /// How many times a pull may defer to a push before failing with
    /// `TableDirty`.
    pub max_deferrals: u32,
    /// Whether `push_with_retry` retries pushes aborted by network errors.
    pub push_retry_on_network: bool,
    /// Retry configuration.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates a new sync configuration with default settings.
    pub fn new() -> Self {
        Self {
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            ordered_incremental_pull: true,
            max_deferrals: 1,
            push_retry_on_network: false,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the maximum pull page size.
    pub fn with_max_page_size(mut self, size: u64) -> Self {
        self.max_page_size = size;
        self
    }

    /// Enables or disables ordered incremental pulls.
    pub fn with_ordered_incremental_pull(mut self, ordered: bool) -> Self {
        self.ordered_incremental_pull = ordered;
        self
    }

    /// Sets how many pushes a pull may trigger on a dirty table.
    pub fn with_max_deferrals(mut self, deferrals: u32) -> Self {
        self.max_deferrals = deferrals;
        self
    }

    /// Enables retrying network-aborted pushes.
    pub fn with_push_retry_on_network(mut self, retry: bool) -> Self {
        self.push_retry_on_network = retry;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_page_size == 0 {
            return Err(SyncError::Config("max_page_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config("retry.max_attempts must be positive".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-call pull overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Overrides `SyncConfig::max_page_size` for one pull.
    pub max_page_size: Option<u64>,
}

impl PullOptions {
    /// Sets the page size for this pull.
    pub fn with_max_page_size(mut self, size: u64) -> Self {
        self.max_page_size = Some(size);
        self
    }

    pub(crate) fn page_size(&self, config: &SyncConfig) -> u64 {
        self.max_page_size
            .filter(|size| *size > 0)
            .unwrap_or(config.max_page_size)
    }
}

/// Backoff policy for `push_with_retry`.
///
/// Only pushes aborted by a retryable error (network failures) are tried
/// again. The wait doubles from `initial_delay` up to `max_delay`, and a
/// random extra of up to a quarter of the wait spreads out clients that lost
/// the network together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Pushes to try in total, the first one included.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the wait, before jitter.
    pub max_delay: Duration,
    /// Whether to randomize waits.
    pub jitter: bool,
}

impl RetryConfig {
    /// Up to `max_attempts` pushes, starting at a 250ms wait.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// A single push, never retried.
    pub fn no_retry() -> Self {
        Self::new(1).without_jitter()
    }

    /// Sets the wait before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps the wait between pushes.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Disables jitter, making waits deterministic.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Wait before retry number `retry` (1 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        let wait = self
            .initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |wait| wait.min(self.max_delay));

        if self.jitter {
            wait + wait.mul_f64(0.25 * unit_random())
        } else {
            wait
        }
    }

    /// Decides whether a push that failed with `error` after `attempts`
    /// pushes is tried again, and how long to wait first.
    pub fn next_retry(&self, attempts: u32, error: &SyncError) -> Option<Duration> {
        if !error.is_retryable() || attempts >= self.max_attempts {
            return None;
        }
        Some(self.backoff(attempts))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A random number in `[0, 1)` from the random bits of a v4 uuid.
fn unit_random() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() as u32;
    f64::from(bits) / (f64::from(u32::MAX) + 1.0)
}

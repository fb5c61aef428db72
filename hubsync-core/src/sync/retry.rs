//! Exponential backoff for transient remote failures.

use std::thread;
use std::time::{Duration, Instant};

use log::warn;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::SyncError;
use crate::RemoteError;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Granularity at which a backoff pause checks for cancellation.
const PAUSE_SLICE: Duration = Duration::from_millis(50);

/// Retry schedule applied to transient remote failures.
///
/// The delay before retry `n` is `base_delay * 2^(n-1)`, capped at
/// `max_delay`. With jitter enabled the actual pause is drawn from the upper
/// half of that window. A `Retry-After` hint from the source replaces the
/// computed delay, still capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

impl RetryPolicy {
    /// Build a jittered policy making at most `max_attempts` attempts.
    ///
    /// A `max_attempts` of zero is treated as one.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: if max_attempts == 0 { 1 } else { max_attempts },
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Replace the attempt limit, keeping the delays. Zero is treated as one.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = if max_attempts == 0 { 1 } else { max_attempts };
        self
    }

    /// Disable jitter so delays are deterministic.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Maximum number of attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound on the pause after failed attempt number `attempt`.
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use hubsync_core::RetryPolicy;
    ///
    /// let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(5));
    /// assert_eq!(policy.backoff_ceiling(1), Duration::from_secs(1));
    /// assert_eq!(policy.backoff_ceiling(3), Duration::from_secs(4));
    /// assert_eq!(policy.backoff_ceiling(4), Duration::from_secs(5));
    /// ```
    #[must_use]
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let factor = 2_u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Pause to take after failed attempt number `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &RemoteError) -> Duration {
        if let Some(requested) = error.retry_after() {
            return requested.min(self.max_delay);
        }
        let ceiling = self.backoff_ceiling(attempt);
        if !self.jitter {
            return ceiling;
        }
        let half = ceiling / 2;
        let spread = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
        half + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Invoke `call` until it succeeds, fails permanently, or the policy runs out.
pub(crate) fn call_with_retry<T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut call: impl FnMut() -> Result<T, RemoteError>,
) -> Result<T, SyncError> {
    let mut attempt = 1;
    loop {
        let error = match call() {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !error.is_transient() {
            return Err(SyncError::from_remote(error));
        }
        if attempt >= policy.max_attempts {
            return Err(SyncError::RetriesExhausted {
                attempts: attempt,
                source: error,
            });
        }

        let delay = policy.delay_for(attempt, &error);
        warn!(
            "{operation} failed (attempt {attempt}/{}): {error}; retrying in {delay:?}",
            policy.max_attempts
        );
        if !pause(cancel, delay) {
            return Err(SyncError::Cancelled);
        }
        attempt += 1;
    }
}

/// Sleep for `delay`, returning `false` as soon as `cancel` fires.
pub(super) fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    let until = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        thread::sleep((until - now).min(PAUSE_SLICE));
    }
}

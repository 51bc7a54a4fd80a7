//! Reconnect policy shared by every channel on the connection.

use std::time::Duration;

use rand::Rng;

/// Default number of consecutive failed attempts before giving up.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);
const DEFAULT_JITTER_RATIO: f64 = 0.5;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Bounded retry with exponential backoff and jitter.
///
/// The delay before attempt `n` (1-based) is `min(max_delay, base_delay · 2^(n-1))`
/// plus a uniformly random extra of up to `jitter_ratio` of that value.
///
/// ```
/// use std::time::Duration;
/// use lobbylink_client::channel::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::default()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_millis(100));
/// assert_eq!(policy.backoff(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff(3), Duration::from_millis(400));
/// assert!(!policy.allows(4));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts tolerated before the link is marked failed.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for the exponential part of the delay.
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter, in `0.0..=1.0`.
    pub jitter_ratio: f64,
    /// Deadline for a single connect attempt.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Values outside `0.0..=1.0` are clamped.
    #[must_use]
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_nan() {
            0.0
        } else {
            ratio.clamp(0.0, 1.0)
        };
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether attempt number `attempt` (1-based) is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Exponential part of the delay before attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = 2_u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before attempt `attempt` for a given jitter sample in `0.0..=1.0`.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let backoff = self.backoff(attempt);
        let sample = if sample.is_nan() {
            0.0
        } else {
            sample.clamp(0.0, 1.0)
        };
        backoff + backoff.mul_f64(self.jitter_ratio * sample)
    }

    /// Delay before attempt `attempt` with fresh random jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_sample(attempt, sample)
    }
}

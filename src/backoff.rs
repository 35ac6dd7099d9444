use std::time::Duration;

/// Retry schedule for webhook deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 1_000,
            max_ms: 60_000,
            jitter_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt once `attempts` attempts have failed:
    /// `base * 2^attempts`, capped at `max_ms`, plus jitter.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.base_ms.max(1);
        let max = self.max_ms.max(base);
        let exp = base.saturating_mul(2u64.saturating_pow(attempts));
        Duration::from_millis(exp.min(max)) + jitter_delay(self.jitter_ms)
    }
}

fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}

/// Doubling delays between reconnect attempts, bounded by `max`.
///
/// The iterator never ends; reconnects keep going at `max` until the
/// broker comes back or the client is closed.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            current: base.max(Duration::from_millis(1)),
            max: max.max(base),
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }
}

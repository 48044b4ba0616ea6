use std::time::Duration;

/// Bounded exponential backoff shared by the connection queue and the reconnection
/// manager. Each of them keeps its own retry counter.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Attempts stop once this many have failed.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Defaults of [`crate::Coordinator::queue_connect`]: 3 attempts.
    pub const fn connection() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30000),
            backoff_multiplier: 2.0,
        }
    }

    /// Defaults of [`crate::Coordinator::enable_auto_reconnect`]: 5 attempts.
    pub const fn reconnection() -> Self {
        Self {
            max_retries: 5,
            ..Self::connection()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before the next attempt once `retry_count` attempts have failed:
    /// `min(initial * multiplier^(retry_count - 1), max)`. A count of zero is
    /// treated as one.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial_ms = self.initial_delay.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let raw_ms = initial_ms * self.backoff_multiplier.max(0.0).powi(exp);
        let ms = if raw_ms.is_finite() {
            raw_ms.min(max_ms)
        } else {
            max_ms
        };
        Duration::from_secs_f64(ms.max(0.0) / 1000.0)
    }

    /// Checks if no further attempt is allowed after `retry_count` failures.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connection()
    }
}

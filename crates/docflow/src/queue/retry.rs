use std::time::Duration;

/// Exponential backoff for redelivered tasks: `base * 2^(attempt - 1)`,
/// capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Deliveries a task gets: the first one plus `max_retries`.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before redelivering after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

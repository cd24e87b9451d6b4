use std::time::Duration;

/// Linear reconnect backoff: `min(base * attempts, max)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.base.saturating_mul(attempts.max(1)).min(self.max)
    }

    /// Records a failed attempt and returns the delay before the next one.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        self.delay_for(self.attempts)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

use std::time::Duration;

/// Exponential reconnect delay, doubled per failed attempt and capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial,
            max: max.max(initial),
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once the attempt cap is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }
        let factor = 2_u32.saturating_pow(self.attempts.min(16));
        self.attempts += 1;
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

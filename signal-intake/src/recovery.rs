//! Connection Retry Policy
//!
//! A failed connection attempt while online is retried after a fixed delay.
//! There is no backoff growth. The attempt count is unbounded unless a cap is
//! configured, and it resets once a connection dispatches its first
//! non-error event.

use crate::config::IntakeConfig;
use std::time::Duration;

/// Fixed-delay retry policy for the receive connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive retries scheduled since the last healthy connection
    pub attempt: u32,
    /// Give up after this many retries (`None` for unbounded)
    pub max_attempts: Option<u32>,
    /// Delay before every retry
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            delay,
        }
    }

    pub fn from_config(config: &IntakeConfig) -> Self {
        Self::new(config.retry_delay, config.max_retry_attempts)
    }

    /// Reset after a healthy connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Check if more attempts are available
    pub fn has_attempts_remaining(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.attempt < max,
            None => true,
        }
    }

    /// Consume one attempt and return the delay, or `None` once exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.has_attempts_remaining() {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay)
    }

    /// Get human-readable status
    pub fn status(&self) -> String {
        match self.max_attempts {
            Some(max) => format!("Attempt {}/{}, delay: {:?}", self.attempt, max, self.delay),
            None => format!("Attempt {}, delay: {:?}", self.attempt, self.delay),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&IntakeConfig::default())
    }
}

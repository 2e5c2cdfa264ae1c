//! Reconnect backoff policy.

use std::time::Duration;

use crate::config::TransportConfig;

/// Exponential reconnect policy for the backend link.
///
/// Delay for attempt `n` is `min(initial_delay * 2^n, max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    should_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(30_000), 5)
    }
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            initial_delay,
            max_delay,
            max_attempts,
            should_reconnect: true,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    /// Failed attempts since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_reconnect(&self) -> bool {
        self.should_reconnect
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Record an unexpected closure.
    ///
    /// Returns the delay to wait before the next attempt, or `None` when the
    /// caller disabled reconnects or the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_reconnect || self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    /// Called on every successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Caller-initiated close: no further reconnects.
    pub fn disable(&mut self) {
        self.should_reconnect = false;
    }

    /// Re-enable reconnects for a fresh `connect()`.
    pub fn rearm(&mut self) {
        self.attempts = 0;
        self.should_reconnect = true;
    }
}

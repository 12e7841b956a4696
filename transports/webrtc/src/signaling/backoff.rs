//! Reconnection backoff for the signaling channel

use crate::config::ReconnectConfig;
use std::time::Duration;

/// Exponential backoff with a bounded number of consecutive retries.
///
/// `delay(attempt) = min(base * factor^attempt, max)`; `attempt` starts at 0
/// and returns to 0 after a successful open.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    factor: f64,
    max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    /// Build a policy from configuration
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            attempt: 0,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            factor: config.factor,
            max_retries: config.max_retries,
        }
    }

    /// Delay for a given attempt number (0-indexed), without advancing
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ms = (self.base_delay_ms as f64) * self.factor.powi(attempt as i32);
        let ms = ms.min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay for the next retry, advancing the attempt counter.
    ///
    /// Returns `None` once `max_retries` consecutive retries were handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let delay = self.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Whether the retry budget is spent
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }

    /// Number of retries handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Reset after a successful open
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Countdown text shown while waiting for a retry, e.g. `"Reconnecting in 2s..."`
pub fn reconnect_message(delay: Duration) -> String {
    let secs = (delay.as_millis() as f64 / 1000.0).round() as u64;
    format!("Reconnecting in {}s...", secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut policy = ReconnectPolicy::default();
        let delays: Vec<u64> = std::iter::from_fn(|| policy.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![1000, 1500, 2250, 3375, 5062]);
        assert!(policy.is_exhausted());
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn test_backoff_clamped_to_max() {
        let policy = ReconnectPolicy::from_config(&ReconnectConfig {
            max_retries: 20,
            ..Default::default()
        });
        assert_eq!(policy.delay_for(9), Duration::from_millis(30000));
        assert_eq!(policy.delay_for(15), Duration::from_millis(30000));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut policy = ReconnectPolicy::default();
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.attempt(), 2);

        policy.reset();
        assert_eq!(policy.attempt(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_reconnect_message_rounds_seconds() {
        assert_eq!(reconnect_message(Duration::from_millis(1000)), "Reconnecting in 1s...");
        assert_eq!(reconnect_message(Duration::from_millis(1500)), "Reconnecting in 2s...");
        assert_eq!(reconnect_message(Duration::from_millis(2250)), "Reconnecting in 2s...");
        assert_eq!(reconnect_message(Duration::from_millis(5062)), "Reconnecting in 5s...");
    }
}

// Parkline Gateway - Edge buffering and batch sync
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Exponential backoff for sync retries
//!
//! The sender never gives up on a batch; the delay grows geometrically from
//! `initial` and is clamped at `max`.

use std::time::Duration;

use crate::config::GatewayConfig;

/// Retry delay schedule with attempt tracking
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a schedule
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            attempt: 0,
        }
    }

    /// Schedule from a gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.backoff_initial,
            config.backoff_max,
            config.backoff_multiplier,
        )
    }

    /// Delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        if !delay_ms.is_finite() || delay_ms >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(delay_ms as u64).min(self.max)
    }

    /// Record a failure and return the delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Delay the next failure would produce, or zero while healthy
    pub fn current(&self) -> Duration {
        if self.attempt == 0 {
            Duration::ZERO
        } else {
            self.delay_for_attempt(self.attempt - 1)
        }
    }

    /// Consecutive failures recorded
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Back to the initial delay after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 2.0);
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(10_000), Duration::from_secs(1));
    }

    #[test]
    fn test_next_delay_and_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30), 2.0);
        assert_eq!(backoff.current(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 2);
        assert_eq!(backoff.current(), Duration::from_secs(1));

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }
}

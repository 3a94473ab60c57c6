//! Reconnect policy — exponential backoff with an attempt ceiling
//!
//! The policy itself is a pure function of the attempt count and the
//! configuration; the link that consults it owns the attempt counter.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy configuration
///
/// The defaults mirror the shipped behavior (5 s base, 1.5x growth,
/// 30 s cap, 10 attempts) but every field is overridable through the
/// config store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Multiplicative growth per attempt
    pub multiplier: f64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Ceiling after which the link gives up until a manual reconnect
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            multiplier: 1.5,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

/// Compute the delay before retry number `attempt` (zero-based)
///
/// `min(base_delay * multiplier^attempt, max_delay)`. Stateless.
pub fn next_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let raw = config.base_delay_ms as f64 * config.multiplier.powi(attempt as i32);
    let capped = raw.min(config.max_delay_ms as f64);
    Duration::from_millis(capped as u64)
}

/// Outcome of consulting the policy after a failed or dropped connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule one retry after this delay
    RetryAfter(Duration),
    /// Ceiling reached; stop retrying and surface a terminal status
    GiveUp,
}

/// Per-link retry bookkeeping
///
/// `attempt` is monotonically non-decreasing while the link stays outside
/// `Connected` and resets to zero exactly on entering `Connected`.
#[derive(Debug, Clone, Default)]
pub struct ReconnectState {
    attempt: u32,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts consumed so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Consult the policy for the next retry
    ///
    /// Returns the delay computed from the current attempt count and then
    /// increments it, so the first drop schedules at `next_delay(0)`.
    /// Once the ceiling is reached the decision is [`RetryDecision::GiveUp`]
    /// and the counter stops advancing.
    pub fn schedule(&mut self, config: &ReconnectConfig) -> RetryDecision {
        if self.attempt >= config.max_attempts {
            return RetryDecision::GiveUp;
        }
        let delay = next_delay(self.attempt, config);
        self.attempt += 1;
        RetryDecision::RetryAfter(delay)
    }

    /// Reset on successful connect (or manual reconnect request)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_matches_formula() {
        let config = ReconnectConfig::default();
        for attempt in 0..12u32 {
            let expected = (5000.0 * 1.5f64.powi(attempt as i32)).min(30_000.0) as u64;
            assert_eq!(
                next_delay(attempt, &config),
                Duration::from_millis(expected),
                "attempt {}",
                attempt
            );
        }
    }

    #[test]
    fn test_next_delay_first_attempts() {
        let config = ReconnectConfig::default();
        assert_eq!(next_delay(0, &config), Duration::from_millis(5_000));
        assert_eq!(next_delay(1, &config), Duration::from_millis(7_500));
        assert_eq!(next_delay(2, &config), Duration::from_millis(11_250));
    }

    #[test]
    fn test_next_delay_caps_at_max() {
        let config = ReconnectConfig::default();
        // 5000 * 1.5^5 = 37968.75 > 30000
        assert_eq!(next_delay(5, &config), Duration::from_millis(30_000));
        assert_eq!(next_delay(20, &config), Duration::from_millis(30_000));
    }

    #[test]
    fn test_next_delay_respects_overrides() {
        let config = ReconnectConfig {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            max_attempts: 3,
        };
        assert_eq!(next_delay(0, &config), Duration::from_millis(100));
        assert_eq!(next_delay(1, &config), Duration::from_millis(200));
        assert_eq!(next_delay(4, &config), Duration::from_millis(1_000));
    }

    #[test]
    fn test_schedule_increments_attempt() {
        let config = ReconnectConfig::default();
        let mut state = ReconnectState::new();

        assert_eq!(
            state.schedule(&config),
            RetryDecision::RetryAfter(Duration::from_millis(5_000))
        );
        assert_eq!(state.attempt(), 1);

        assert_eq!(
            state.schedule(&config),
            RetryDecision::RetryAfter(Duration::from_millis(7_500))
        );
        assert_eq!(state.attempt(), 2);
    }

    #[test]
    fn test_schedule_gives_up_at_ceiling() {
        let config = ReconnectConfig::default();
        let mut state = ReconnectState::new();

        for _ in 0..10 {
            assert!(matches!(
                state.schedule(&config),
                RetryDecision::RetryAfter(_)
            ));
        }
        assert_eq!(state.attempt(), 10);

        // The eleventh consultation is terminal, not a further retry.
        assert_eq!(state.schedule(&config), RetryDecision::GiveUp);
        assert_eq!(state.attempt(), 10);
        assert_eq!(state.schedule(&config), RetryDecision::GiveUp);
    }

    #[test]
    fn test_reset_clears_attempt() {
        let config = ReconnectConfig::default();
        let mut state = ReconnectState::new();
        for _ in 0..10 {
            let _ = state.schedule(&config);
        }
        assert_eq!(state.schedule(&config), RetryDecision::GiveUp);

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert_eq!(
            state.schedule(&config),
            RetryDecision::RetryAfter(Duration::from_millis(5_000))
        );
    }
}

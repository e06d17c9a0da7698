//! Reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter window in milliseconds.
pub const DEFAULT_JITTER_WINDOW_MS: u64 = 500;
/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Reconnect parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any delay, jitter included.
    pub max_delay_ms: u64,
    /// Random extra delay in `[0, jitter_window_ms]`. Must not exceed
    /// `base_delay_ms`, which keeps successive delays non-decreasing.
    pub jitter_window_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_window_ms: DEFAULT_JITTER_WINDOW_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Check the policy's internal constraints.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("base_delay_ms must be positive".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::Invalid(
                "max_delay_ms must be at least base_delay_ms".into(),
            ));
        }
        if self.jitter_window_ms > self.base_delay_ms {
            return Err(ConfigError::Invalid(
                "jitter_window_ms must not exceed base_delay_ms".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (zero-based).
    ///
    /// `min(max_delay, base_delay * 2^attempt + jitter)`, with `jitter`
    /// clamped to the jitter window.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exponential = self.base_delay_ms.saturating_mul(1u64 << attempt.min(32));
        let jitter = jitter_ms.min(self.jitter_window_ms);
        Duration::from_millis(exponential.saturating_add(jitter).min(self.max_delay_ms))
    }
}

/// Source of the random part of a backoff delay.
pub trait JitterSource: Send {
    /// A value in `[0, window_ms]`.
    fn sample(&mut self, window_ms: u64) -> u64;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&mut self, window_ms: u64) -> u64 {
        rand::rng().random_range(0..=window_ms)
    }
}

/// Always the same jitter. Useful for deterministic tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedJitter(pub u64);

impl JitterSource for FixedJitter {
    fn sample(&mut self, window_ms: u64) -> u64 {
        self.0.min(window_ms)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        assert!(ReconnectPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_delay_doubles_until_capped() {
        let policy = ReconnectPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_window_ms: 0,
            max_attempts: 10,
        };

        let delays: Vec<u64> = (0..6)
            .map(|a| policy.delay_for(a, 0).as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_jitter_is_clamped_to_window() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0, 10_000), Duration::from_millis(1_500));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX, 500), Duration::from_millis(30_000));
    }

    #[test]
    fn test_validate_rejects_bad_policies() {
        let base = ReconnectPolicy::default();

        let cases = [
            ReconnectPolicy { base_delay_ms: 0, ..base },
            ReconnectPolicy { max_delay_ms: 10, ..base },
            ReconnectPolicy { jitter_window_ms: 5_000, ..base },
            ReconnectPolicy { max_attempts: 0, ..base },
        ];
        for policy in cases {
            assert!(matches!(policy.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_random_jitter_stays_in_window() {
        let mut jitter = RandomJitter;
        for _ in 0..100 {
            assert!(jitter.sample(50) <= 50);
        }
        assert_eq!(jitter.sample(0), 0);
    }

    proptest! {
        #[test]
        fn prop_delays_non_decreasing_and_capped(
            base in 1u64..5_000,
            extra in 0u64..100_000,
            window_pct in 0u64..=100,
            jitters in proptest::collection::vec(any::<u64>(), 1..12),
        ) {
            let policy = ReconnectPolicy {
                base_delay_ms: base,
                max_delay_ms: base + extra,
                jitter_window_ms: base * window_pct / 100,
                max_attempts: 12,
            };
            prop_assert!(policy.validate().is_ok());

            let mut previous = Duration::ZERO;
            for (attempt, jitter) in jitters.into_iter().enumerate() {
                let delay = policy.delay_for(attempt as u32, jitter % (policy.jitter_window_ms + 1));
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(policy.max_delay_ms));
                prop_assert!(delay >= Duration::from_millis(base.min(policy.max_delay_ms)));
                previous = delay;
            }
        }
    }
}

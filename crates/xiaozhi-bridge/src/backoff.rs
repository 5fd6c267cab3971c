//! Reconnection backoff policy.
//!
//! Delay grows exponentially from an initial value up to a cap, with a small
//! random jitter applied at use so that many bridges restarting at once do
//! not retry in lockstep. Attempt 0 carries no delay: the first attempt (and
//! the first retry after an established connection drops) is immediate.

use std::time::Duration;

/// Maximum jitter fraction added on top of the computed delay.
pub const JITTER_FRACTION: f64 = 0.1;

/// Pure policy for translating attempt counts into delays.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first delayed retry.
    pub initial_delay: Duration,
    /// Upper bound applied before jitter.
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy from explicit bounds.
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
        }
    }

    /// Compute the capped, jitter-free delay for an attempt number.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.min(30);
        let delay_ms = millis(self.initial_delay).saturating_mul(1_u64 << exp);
        Duration::from_millis(delay_ms.min(millis(self.max_delay)))
    }

    /// Compute the delay for an attempt, drawing jitter from the thread RNG.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::random())
    }

    /// Compute the delay with an explicit jitter draw in `[0.0, 1.0]`.
    ///
    /// The draw maps to a multiplier in `[1.0, 1.0 + JITTER_FRACTION]`,
    /// applied after the cap. Deterministic, so tests need no RNG.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() {
            return base;
        }
        let factor = jitter.clamp(0.0, 1.0).mul_add(JITTER_FRACTION, 1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let jittered = (millis(base) as f64 * factor) as u64;
        Duration::from_millis(jittered)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    #[test]
    fn attempt_zero_is_immediate() {
        assert_eq!(policy().delay_with_jitter(0, 0.0), Duration::ZERO);
        assert_eq!(policy().delay_with_jitter(0, 1.0), Duration::ZERO);
    }

    #[test]
    fn delay_doubles_until_cap() {
        let policy = policy();
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        assert_eq!(policy.base_delay(5), Duration::from_secs(32));
        assert_eq!(policy.base_delay(6), Duration::from_secs(60));
        assert_eq!(policy.base_delay(30), Duration::from_secs(60));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        assert_eq!(policy().base_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = policy();
        for attempt in 1..10 {
            let base = policy.base_delay(attempt);
            let low = policy.delay_with_jitter(attempt, 0.0);
            let high = policy.delay_with_jitter(attempt, 1.0);
            assert_eq!(low, base);
            assert_eq!(high.as_millis(), base.as_millis() * 11 / 10);
        }
    }

    #[test]
    fn jitter_draw_is_clamped() {
        let policy = policy();
        assert_eq!(
            policy.delay_with_jitter(1, -3.0),
            policy.delay_with_jitter(1, 0.0)
        );
        assert_eq!(
            policy.delay_with_jitter(1, 7.5),
            policy.delay_with_jitter(1, 1.0)
        );
    }

    #[test]
    fn random_jitter_respects_bounds() {
        let policy = policy();
        for attempt in 1..6 {
            let base = policy.base_delay(attempt);
            let delay = policy.delay(attempt);
            assert!(delay >= base);
            assert!(delay.as_millis() <= base.as_millis() * 11 / 10);
        }
    }
}

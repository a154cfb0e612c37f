//! Randomized exponential backoff.

use rand::Rng;
use std::time::Duration;

/// Retry schedule for node requests.
///
/// Attempt `k` (0-based, counting retries) sleeps for
/// `min(base_delay * factor^k, max_delay)` scaled by a uniform factor in
/// `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Growth factor per retry
    pub factor: f64,
    /// Cap applied before jitter
    pub max_delay: Duration,
    /// Relative jitter (0.2 = ±20%)
    pub jitter: f64,
    /// Deadline for a single attempt
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry `attempt`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.max(1.0).powi(attempt.min(63) as i32);
        let scaled = self.base_delay.as_secs_f64() * exp;
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Jittered delay before retry `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::from_secs_f64(nominal);
        }
        let scale = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(nominal * scale)
    }

    /// Upper bound on the total time spent sleeping across all retries.
    pub fn max_total_backoff(&self) -> Duration {
        let jitter = 1.0 + self.jitter.clamp(0.0, 1.0);
        (0..self.max_attempts.saturating_sub(1))
            .map(|k| self.nominal_delay(k).mul_f64(jitter))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_millis(1000),
            jitter: 0.2,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_nominal_delay_grows_and_caps() {
        let p = policy();
        assert_eq!(p.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(p.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(p.nominal_delay(3), Duration::from_millis(800));
        assert_eq!(p.nominal_delay(4), Duration::from_millis(1000));
        assert_eq!(p.nominal_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let p = policy();
        for attempt in 0..8 {
            let nominal = p.nominal_delay(attempt).as_secs_f64();
            for _ in 0..200 {
                let d = p.delay_for(attempt).as_secs_f64();
                assert!(d >= nominal * 0.8 - 1e-9, "{d} below bound");
                assert!(d <= nominal * 1.2 + 1e-9, "{d} above bound");
            }
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let p = RetryPolicy {
            jitter: 0.0,
            ..policy()
        };
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_max_total_backoff() {
        let p = RetryPolicy {
            max_attempts: 3,
            jitter: 0.0,
            ..policy()
        };
        // Two sleeps: 100ms + 200ms
        assert_eq!(p.max_total_backoff(), Duration::from_millis(300));
    }
}

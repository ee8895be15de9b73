//! Retry pacing for the session transport.
//!
//! Every connection attempt, including the first, waits `base + jitter` before the socket
//! is opened. The jitter is a fraction of a window that starts at `initial_jitter` and
//! grows by `jitter_step` per attempt until it reaches `jitter_cap`. The fraction is drawn
//! once per [`Backoff`] so that the delays of one connect cycle never decrease.

use std::time::Duration;

use rand::Rng;

/// Message reported once the attempt cap has been reached.
pub const RETRY_EXHAUSTED_MESSAGE: &str =
    "Unable to allocate NEURON instance. Please reload the page to retry.";

/// Configuration for connection retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Minimum pause before any attempt.
    pub base: Duration,
    /// Jitter window for the first attempt.
    pub initial_jitter: Duration,
    /// Growth of the jitter window per attempt.
    pub jitter_step: Duration,
    /// Upper bound of the jitter window.
    pub jitter_cap: Duration,
    /// Maximum number of attempts per connect cycle.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(2000),
            initial_jitter: Duration::from_millis(500),
            jitter_step: Duration::from_millis(2),
            jitter_cap: Duration::from_millis(30_000),
            max_attempts: 20,
        }
    }
}

impl BackoffPolicy {
    /// Jitter window for a given attempt number (1-based).
    #[must_use]
    pub fn jitter_window(&self, attempt: u32) -> Duration {
        let grown = self
            .initial_jitter
            .saturating_add(self.jitter_step.saturating_mul(attempt.saturating_sub(1)));
        grown.min(self.jitter_cap)
    }

    /// Calculate the pause before a given attempt (1-based).
    ///
    /// `fraction` is clamped to `[0, 1]` and selects a point inside the jitter window.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32, fraction: f64) -> Duration {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.base + self.jitter_window(attempt).mul_f64(fraction)
    }

    /// Check if another attempt may follow `failures` failed ones.
    #[must_use]
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }

    /// Largest pause this policy can produce.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.base + self.jitter_cap
    }
}

/// Retry state of one connect cycle.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    fraction: f64,
    attempt: u32,
}

impl Backoff {
    /// Starts a new cycle, drawing the jitter fraction from `rng`.
    pub fn new<R: Rng + ?Sized>(policy: BackoffPolicy, rng: &mut R) -> Self {
        Self {
            policy,
            fraction: rng.gen_range(0.0..1.0),
            attempt: 0,
        }
    }

    /// Number of attempts scheduled so far.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns `true` if another attempt is allowed.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.policy.should_retry(self.attempt)
    }

    /// Schedules the next attempt and returns its number and pause.
    ///
    /// Returns `None` once the attempt cap is reached.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if !self.can_retry() {
            return None;
        }
        self.attempt += 1;
        Some((
            self.attempt,
            self.policy.delay_for_attempt(self.attempt, self.fraction),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_jitter_window_growth() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.jitter_window(1), Duration::from_millis(500));
        assert_eq!(policy.jitter_window(2), Duration::from_millis(502));
        assert_eq!(policy.jitter_window(20), Duration::from_millis(538));

        let steep = BackoffPolicy {
            jitter_step: Duration::from_millis(10_000),
            ..Default::default()
        };
        assert_eq!(steep.jitter_window(10), Duration::from_millis(30_000)); // Capped
    }

    #[test]
    fn test_delay_bounds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(1, 1.0), Duration::from_millis(2500));
        assert_eq!(policy.delay_for_attempt(1, 7.0), Duration::from_millis(2500));
        assert_eq!(policy.delay_for_attempt(1, f64::NAN), Duration::from_millis(2000));
        assert_eq!(policy.max_delay(), Duration::from_millis(32_000));
    }

    #[test]
    fn test_delays_never_decrease() {
        let policy = BackoffPolicy {
            jitter_step: Duration::from_millis(3_000),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut backoff = Backoff::new(policy, &mut rng);
            let mut previous = Duration::ZERO;
            while let Some((_, delay)) = backoff.next_attempt() {
                assert!(delay >= previous);
                assert!(delay <= policy.max_delay());
                previous = delay;
            }
        }
    }

    #[test]
    fn test_attempt_cap() {
        let policy = BackoffPolicy::default();
        let mut backoff = Backoff::new(policy, &mut StdRng::seed_from_u64(1));
        let mut scheduled = 0;
        while let Some((attempt, _)) = backoff.next_attempt() {
            scheduled += 1;
            assert_eq!(attempt, scheduled);
        }
        assert_eq!(scheduled, 20);
        assert!(!backoff.can_retry());
        assert!(policy.should_retry(19));
        assert!(!policy.should_retry(20));
    }
}

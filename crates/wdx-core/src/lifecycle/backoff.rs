use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// Retry policy for the outbound session.
#[derive(Clone, Debug, Serialize)]
pub struct LifecycleConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Consecutive failures before the breaker may open.
    pub circuit_threshold: u32,
    pub circuit_cooldown: Duration,
    /// Upper bound on a single cooldown wait.
    pub max_circuit_wait: Duration,
    /// Bound on one call to the establish callback.
    pub establish_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_millis(2_000),
            multiplier: 1.5,
            max_delay: Duration::from_secs(300),
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(600),
            max_circuit_wait: Duration::from_secs(300),
            establish_timeout: Duration::from_secs(60),
        }
    }
}

pub const JITTER_MIN: f64 = 0.5;
pub const JITTER_MAX: f64 = 1.0;

/// Uniform jitter factor in `[0.5, 1.0]`.
pub fn random_jitter() -> f64 {
    rand::rng().random_range(JITTER_MIN..=JITTER_MAX)
}

impl LifecycleConfig {
    /// Un-jittered exponential delay for a 1-based attempt number.
    fn exponential(&self, attempt: u32) -> f64 {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.base_delay.as_secs_f64() * self.multiplier.powi(exp)
    }

    /// `min(base * multiplier^(attempt-1) * jitter, max_delay)`.
    pub fn backoff_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        let secs = self.exponential(attempt) * jitter;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Inclusive range every jittered delay for `attempt` falls into.
    pub fn backoff_bounds(&self, attempt: u32) -> (Duration, Duration) {
        (
            self.backoff_delay(attempt, JITTER_MIN),
            self.backoff_delay(attempt, JITTER_MAX),
        )
    }

    /// The breaker is open once failures pile up and the last good session is
    /// older than the cooldown.
    pub fn circuit_open(&self, consecutive_failures: u32, since_last_success: Duration) -> bool {
        consecutive_failures >= self.circuit_threshold && since_last_success > self.circuit_cooldown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> LifecycleConfig {
        LifecycleConfig {
            base_delay: Duration::from_millis(2_000),
            multiplier: 1.5,
            max_delay: Duration::from_secs(300),
            ..LifecycleConfig::default()
        }
    }

    #[test]
    fn third_attempt_bounds() {
        let (lo, hi) = cfg().backoff_bounds(3);
        assert_eq!(lo, Duration::from_millis(2_250));
        assert_eq!(hi, Duration::from_millis(4_500));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let c = cfg();
        for attempt in 1..=12 {
            let (lo, hi) = c.backoff_bounds(attempt);
            for _ in 0..50 {
                let d = c.backoff_delay(attempt, random_jitter());
                assert!(d >= lo && d <= hi, "attempt {attempt}: {d:?} not in [{lo:?}, {hi:?}]");
                assert!(d <= c.max_delay);
            }
        }
    }

    #[test]
    fn large_attempts_are_capped() {
        let c = cfg();
        assert_eq!(c.backoff_delay(40, 0.5), c.max_delay);
        assert_eq!(c.backoff_delay(u32::MAX, 1.0), c.max_delay);
    }

    #[test]
    fn first_attempt_uses_base_delay() {
        let c = cfg();
        assert_eq!(c.backoff_delay(1, 1.0), Duration::from_secs(2));
        assert_eq!(c.backoff_delay(1, 0.5), Duration::from_secs(1));
        // Out-of-range jitter is clamped rather than trusted.
        assert_eq!(c.backoff_delay(1, 3.0), Duration::from_secs(2));
    }

    #[test]
    fn circuit_needs_both_failures_and_stale_success() {
        let c = LifecycleConfig {
            circuit_threshold: 5,
            circuit_cooldown: Duration::from_secs(600),
            ..LifecycleConfig::default()
        };
        assert!(!c.circuit_open(4, Duration::from_secs(601)));
        assert!(!c.circuit_open(5, Duration::from_secs(600)));
        assert!(c.circuit_open(5, Duration::from_secs(601)));
        assert!(c.circuit_open(9, Duration::from_secs(3_600)));
    }
}

//! Timing Policy
//!
//! Clock-drift compensation, validity estimation and jittered retry
//! delays. Everything here is a pure function of configuration and the
//! elapsed time handed in by the caller.

use rand::Rng;
use std::time::Duration;

use crate::config::LockConfig;

/// Timing policy for lock acquisition and extension
#[derive(Debug, Clone)]
pub struct TimingPolicy {
    /// Drift as a fraction of the TTL
    drift_factor: f64,
    /// Fixed drift allowance for store expiry precision
    fixed_overhead: Duration,
    /// Upper bound of the retry delay
    retry_delay: Duration,
}

impl TimingPolicy {
    /// Create a new timing policy
    pub fn new(drift_factor: f64, fixed_overhead: Duration, retry_delay: Duration) -> Self {
        Self {
            drift_factor,
            fixed_overhead,
            retry_delay,
        }
    }

    /// Build from lock configuration
    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(
            config.drift_factor,
            Duration::from_millis(config.clock_drift_overhead_ms),
            config.retry_delay(),
        )
    }

    /// Drift allowance in milliseconds for a TTL
    pub fn drift_for(&self, ttl_ms: u64) -> f64 {
        ttl_ms as f64 * self.drift_factor + self.fixed_overhead.as_secs_f64() * 1000.0
    }

    /// Estimated validity left, in milliseconds. May be zero or negative.
    pub fn validity(&self, ttl_ms: u64, elapsed: Duration) -> f64 {
        ttl_ms as f64 - elapsed.as_secs_f64() * 1000.0 - self.drift_for(ttl_ms)
    }

    /// Randomized delay in `[retry_delay / 2, retry_delay]`
    pub fn retry_delay(&self) -> Duration {
        let max = self.retry_delay.as_millis() as u64;
        let min = max / 2;
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::from_config(&LockConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift() {
        let policy = TimingPolicy::default();
        // 10000 * 0.01 + 2
        assert!((policy.drift_for(10_000) - 102.0).abs() < 1e-9);
        assert!((policy.drift_for(100) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_validity() {
        let policy = TimingPolicy::default();
        let v = policy.validity(10_000, Duration::from_millis(0));
        assert!((v - 9_898.0).abs() < 1e-9);

        let v = policy.validity(10_000, Duration::from_millis(500));
        assert!((v - 9_398.0).abs() < 1e-9);

        // Slow round trip eats the whole budget
        assert!(policy.validity(100, Duration::from_millis(150)) <= 0.0);
    }

    #[test]
    fn test_retry_delay_bounds() {
        let policy = TimingPolicy::new(0.01, Duration::from_millis(2), Duration::from_millis(200));
        for _ in 0..1000 {
            let d = policy.retry_delay();
            assert!(d >= Duration::from_millis(100), "delay {:?} below half", d);
            assert!(d <= Duration::from_millis(200), "delay {:?} above max", d);
        }

        let zero = TimingPolicy::new(0.01, Duration::ZERO, Duration::ZERO);
        assert_eq!(zero.retry_delay(), Duration::ZERO);
    }
}

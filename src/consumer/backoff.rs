use crate::config::ConsumerConfig;
use rand::Rng;
use std::time::Duration;

/// Retry policy for failed ingestion attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Processing attempts allowed before a registration is marked failed.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ConsumerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ConsumerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
        }
    }

    /// Whether a record that has used `attempts` attempts may try again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// `min(base * 2^attempts, max)` plus up to `jitter` of random spread.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        let capped = base_ms.saturating_mul(factor).min(self.max.as_millis() as u64);

        let jitter_ms = self.jitter.as_millis() as u64;
        let spread = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        Duration::from_millis(capped + spread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(250),
            max: Duration::from_millis(5_000),
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let p = policy(0);
        assert_eq!(p.delay_for(0), Duration::from_millis(250));
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(5), Duration::from_millis(5_000));
        assert_eq!(p.delay_for(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let p = policy(100);
        for _ in 0..50 {
            let d = p.delay_for(1);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_should_retry_below_cap_only() {
        let p = policy(0);
        assert!(p.should_retry(1));
        assert!(p.should_retry(2));
        assert!(!p.should_retry(3));
        assert!(!p.should_retry(4));
    }
}

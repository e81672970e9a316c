use std::time::Duration;

use rand::Rng;

use tagrelay_config::RelayConfig;

/// Exponential backoff for outbound deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Exclusive upper bound of the random jitter added to every delay.
    pub jitter: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for RetryPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: Duration::from_millis(config.retry_jitter_ms),
            max_retries: config.max_retries,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retry, max)`, before jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay to sleep before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.backoff(retry) + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..4).map(|n| policy.backoff(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::default();
        for retry in 0..4 {
            for _ in 0..50 {
                let delay = policy.delay(retry);
                assert!(delay >= policy.backoff(retry));
                assert!(delay < policy.backoff(retry) + policy.jitter);
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }
}

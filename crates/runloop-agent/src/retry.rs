#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
            jitter: true,
        }
    }
}

/// Retry budget for retryable model provider errors. `max_attempts` counts
/// the first call.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoffConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: RetryBackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: RetryBackoffConfig::default(),
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig, jitter_seed: u64) -> u64 {
    let exp = (attempt.saturating_sub(1)) as i32;
    let base = (config.initial_delay_ms as f64) * config.backoff_factor.powi(exp);
    let mut delay = base.min(config.max_delay_ms as f64);
    if config.jitter {
        delay *= jitter_factor(attempt, jitter_seed);
    }
    delay.round().max(0.0) as u64
}

// xorshift in [0.5, 1.5)
fn jitter_factor(attempt: u32, jitter_seed: u64) -> f64 {
    let mut x = jitter_seed ^ ((attempt as u64) << 32) ^ 0x9E3779B97F4A7C15;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    let r = x.wrapping_mul(0x2545F4914F6CDD1D);
    let unit = (r as f64) / (u64::MAX as f64);
    0.5 + unit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_for_attempt_ms_no_jitter_expected_capped_exponential_sequence() {
        let config = RetryBackoffConfig {
            initial_delay_ms: 100,
            backoff_factor: 3.0,
            max_delay_ms: 1_000,
            jitter: false,
        };
        assert_eq!(delay_for_attempt_ms(1, &config, 0), 100);
        assert_eq!(delay_for_attempt_ms(2, &config, 0), 300);
        assert_eq!(delay_for_attempt_ms(3, &config, 0), 900);
        assert_eq!(delay_for_attempt_ms(4, &config, 0), 1_000);
    }

    #[test]
    fn delay_for_attempt_ms_with_jitter_expected_within_half_to_one_and_half() {
        let config = RetryBackoffConfig::default();
        for seed in [0_u64, 7, 42, u64::MAX] {
            let delay = delay_for_attempt_ms(2, &config, seed);
            assert!((200..=600).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn retry_policy_default_allows_three_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::none().should_retry(1));
    }
}

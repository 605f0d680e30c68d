use felix_core::ErrorClass;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Linear,
    #[default]
    Exponential,
    Fibonacci,
}

/// `[retry]` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    /// Delay after the first failed attempt. Overridden by the plan's
    /// `retryDelayMs` when the plan sets one.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap applied to every computed delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Decides whether a failed attempt is retried, and after how long.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, config: RetryConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            config,
        }
    }

    /// `attempt` is the 1-based number of the attempt that just failed.
    /// Permanent failures are never retried; transient and unrecognised ones
    /// are retried until the attempt budget is spent.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32) -> bool {
        class != ErrorClass::Permanent && attempt < self.max_attempts
    }

    /// Wait before the attempt following `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(compute_delay_ms(&self.config, attempt))
    }
}

fn compute_delay_ms(config: &RetryConfig, attempt: u32) -> u64 {
    let n = attempt.max(1);
    let base = config.base_delay_ms;
    let delay = match config.strategy {
        BackoffStrategy::Linear => base.saturating_mul(u64::from(n)),
        BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(n - 1)),
        BackoffStrategy::Fibonacci => base.saturating_mul(fibonacci(n)),
    };
    delay.min(config.max_delay_ms)
}

/// 1, 1, 2, 3, 5, ...
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy::new(
            3,
            RetryConfig {
                strategy,
                base_delay_ms: 100,
                max_delay_ms: 1_000,
            },
        )
    }

    fn delays(policy: &RetryPolicy) -> Vec<u64> {
        (1..=6).map(|a| policy.delay(a).as_millis() as u64).collect()
    }

    #[test]
    fn test_linear_backoff() {
        assert_eq!(delays(&policy(BackoffStrategy::Linear)), vec![100, 200, 300, 400, 500, 600]);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        assert_eq!(
            delays(&policy(BackoffStrategy::Exponential)),
            vec![100, 200, 400, 800, 1_000, 1_000]
        );
    }

    #[test]
    fn test_fibonacci_backoff() {
        assert_eq!(delays(&policy(BackoffStrategy::Fibonacci)), vec![100, 100, 200, 300, 500, 800]);
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.delay(u32::MAX).as_millis(), 1_000);
        let f = policy(BackoffStrategy::Fibonacci);
        assert_eq!(f.delay(500).as_millis(), 1_000);
    }

    #[test]
    fn test_should_retry_by_class() {
        let p = policy(BackoffStrategy::Linear);
        assert!(p.should_retry(ErrorClass::Transient, 1));
        assert!(p.should_retry(ErrorClass::Unknown, 2));
        assert!(!p.should_retry(ErrorClass::Transient, 3));
        assert!(!p.should_retry(ErrorClass::Permanent, 1));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let p = RetryPolicy::new(0, RetryConfig::default());
        assert_eq!(p.max_attempts, 1);
        assert!(!p.should_retry(ErrorClass::Transient, 1));
    }

    #[test]
    fn test_config_defaults_from_empty_toml() {
        let config: RetryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RetryConfig::default());
        let config: RetryConfig = serde_json::from_str(r#"{"strategy":"fibonacci"}"#).unwrap();
        assert_eq!(config.strategy, BackoffStrategy::Fibonacci);
    }
}

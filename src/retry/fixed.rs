use super::RetryPolicy;
use std::time::Duration;

/// 固定延迟重试策略
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_after_max_attempts() {
        let policy = FixedRetryPolicy::new(5, Duration::from_millis(10));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(10));
    }
}

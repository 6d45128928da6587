use super::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    /// 抖动比例 [0, 1]，避免大量客户端同时重连
    jitter: f64,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// 不限次数的退避（用于长连接的重新订阅）
    pub fn unbounded(base_delay: Duration, max_delay: Duration) -> Self {
        Self::new(usize::MAX, base_delay, max_delay)
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn backoff_duration(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        if self.jitter <= f64::EPSILON {
            return delay;
        }
        let factor = 1.0 - rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(factor)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

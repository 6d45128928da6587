//! 重试策略模块
//!
//! 租约申请使用固定间隔重试，监听流断开后的重新订阅使用带抖动的指数退避。

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffPolicy;
pub use fixed::FixedRetryPolicy;

use std::time::Duration;

/// 重试策略 trait
///
/// `attempt` 从 1 开始计数，表示已经失败的次数。
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts()
    }
    fn backoff_duration(&self, attempt: usize) -> Duration;
    fn max_attempts(&self) -> usize;
}

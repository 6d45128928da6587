use std::time::Duration;

use tonic::{Request, Status};

use super::ClientInterceptor;

/// 默认调用超时
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// 超时拦截器，为每次调用设置 `grpc-timeout`
#[derive(Debug, Clone)]
pub struct TimeoutInterceptor {
    timeout: Duration,
}

impl TimeoutInterceptor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TimeoutInterceptor {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT)
    }
}

impl ClientInterceptor for TimeoutInterceptor {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn intercept(&self, mut req: Request<()>) -> Result<Request<()>, Status> {
        req.set_timeout(self.timeout);
        Ok(req)
    }
}

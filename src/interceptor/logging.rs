use tonic::{Request, Status};
use tracing::debug;

use super::ClientInterceptor;

/// 日志拦截器
///
/// 客户端拦截器拿不到方法路径，这里只记录调用的超时与元数据规模。
#[derive(Debug, Clone, Default)]
pub struct LoggingInterceptor;

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl ClientInterceptor for LoggingInterceptor {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn intercept(&self, req: Request<()>) -> Result<Request<()>, Status> {
        let timeout = req
            .metadata()
            .get("grpc-timeout")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");

        debug!(
            timeout,
            metadata_entries = req.metadata().len(),
            "Outgoing gRPC request"
        );
        Ok(req)
    }
}

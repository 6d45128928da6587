use tonic::metadata::MetadataValue;
use tonic::{Request, Status};
use tracing::debug;

use super::{ClientInterceptor, extract_trace_info};

/// 追踪拦截器
///
/// 请求没有 `x-request-id` 时生成一个，已有的追踪信息原样透传。
#[derive(Debug, Clone, Default)]
pub struct TracingInterceptor;

impl TracingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

impl ClientInterceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn intercept(&self, mut req: Request<()>) -> Result<Request<()>, Status> {
        if !req.metadata().contains_key("x-request-id") {
            let request_id = crate::utils::generate_request_id();
            let value = MetadataValue::try_from(request_id.as_str())
                .map_err(|e| Status::internal(format!("invalid request id: {}", e)))?;
            req.metadata_mut().insert("x-request-id", value);
        }

        if let Some(trace_info) = extract_trace_info(&req) {
            debug!(
                trace_id = %trace_info.trace_id,
                request_id = %trace_info.request_id,
                "Propagating trace context"
            );
        }
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generates_request_id_once() {
        let interceptor = TracingInterceptor::new();
        let req = interceptor.intercept(Request::new(())).unwrap();
        let first = req.metadata().get("x-request-id").unwrap().clone();

        let req = interceptor.intercept(req).unwrap();
        assert_eq!(req.metadata().get("x-request-id").unwrap(), &first);
    }
}

//! gRPC 客户端拦截器模块
//!
//! 拦截器注册到 [`InterceptorRegistry`]，channel 工厂在创建 channel 时取一份快照
//! 组装成 [`InterceptorChain`]，之后的注册只影响新创建的 channel。

pub mod chain;
pub mod logging;
pub mod timeout;
pub mod tracing;

pub use chain::InterceptorChain;
pub use logging::LoggingInterceptor;
pub use timeout::TimeoutInterceptor;
pub use self::tracing::TracingInterceptor;

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tonic::{Request, Status};

/// 客户端拦截器
pub trait ClientInterceptor: Send + Sync {
    fn name(&self) -> &'static str;

    fn intercept(&self, req: Request<()>) -> Result<Request<()>, Status>;
}

/// 全局拦截器列表
#[derive(Default)]
pub struct InterceptorRegistry {
    interceptors: RwLock<Arc<Vec<Arc<dyn ClientInterceptor>>>>,
}

static GLOBAL_INTERCEPTORS: OnceLock<Arc<InterceptorRegistry>> = OnceLock::new();

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级共享拦截器列表
    pub fn global() -> Arc<InterceptorRegistry> {
        GLOBAL_INTERCEPTORS
            .get_or_init(|| Arc::new(InterceptorRegistry::new()))
            .clone()
    }

    /// 追加拦截器，按注册顺序执行
    pub fn register(&self, interceptor: Arc<dyn ClientInterceptor>) {
        let mut guard = self
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(interceptor);
        *guard = Arc::new(next);
    }

    pub fn len(&self) -> usize {
        self.snapshot_list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前拦截器列表的快照
    pub fn snapshot(&self) -> InterceptorChain {
        InterceptorChain::new(self.snapshot_list())
    }

    fn snapshot_list(&self) -> Arc<Vec<Arc<dyn ClientInterceptor>>> {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// 追踪信息
#[derive(Debug, Clone)]
pub struct TraceInfo {
    pub trace_id: String,
    pub request_id: String,
}

/// 提取追踪信息
pub fn extract_trace_info<T>(req: &Request<T>) -> Option<TraceInfo> {
    let metadata = req.metadata();

    let trace_id = metadata
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let request_id = metadata
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    if trace_id.is_empty() && request_id.is_empty() {
        return None;
    }

    Some(TraceInfo {
        trace_id,
        request_id,
    })
}

use std::fmt;
use std::sync::Arc;

use tonic::service::Interceptor;
use tonic::{Request, Status};

use super::ClientInterceptor;

/// 拦截器链
///
/// 按顺序执行，任一拦截器返回错误则整个调用失败。
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<Vec<Arc<dyn ClientInterceptor>>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Arc<Vec<Arc<dyn ClientInterceptor>>>) -> Self {
        Self { interceptors }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("interceptors", &self.names())
            .finish()
    }
}

impl Interceptor for InterceptorChain {
    fn call(&mut self, mut req: Request<()>) -> Result<Request<()>, Status> {
        for interceptor in self.interceptors.iter() {
            req = interceptor.intercept(req)?;
        }
        Ok(req)
    }
}

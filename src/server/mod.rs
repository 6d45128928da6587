//! gRPC 服务端模块
//!
//! [`GrpcServerFactory`] 收集服务定义，`create_server` 时检查重名、
//! 配置 HTTP/2 keep-alive 与执行模型，得到可以直接启动的 [`GrpcServer`]。
//! 服务启动后由 [`ServiceRegistrar`] 把本实例注册到注册中心。

pub mod registrar;

pub use registrar::ServiceRegistrar;

use std::collections::HashSet;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::Server;
use tower::Service;
use tracing::{info, warn};

use crate::config::GrpcServerConfig;
use crate::error::{FlareError, Result};

/// 工作线程名前缀
pub const WORKER_THREAD_PREFIX: &str = "grpc-worker-group-";

type Install = Box<dyn FnOnce(&mut RoutesBuilder) + Send>;

/// 服务定义
///
/// 保存服务名与一个把服务挂到路由表上的闭包，
/// 生成代码中的 `XxxServer::new(handler)` 可以直接传入。
pub struct ServiceDefinition {
    name: &'static str,
    install: Install,
}

impl ServiceDefinition {
    pub fn new<S>(service: S) -> Self
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            name: S::NAME,
            install: Box::new(move |routes: &mut RoutesBuilder| {
                routes.add_service(service);
            }),
        }
    }

    /// 完整服务名，例如 `helloworld.Greeter`
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .finish()
    }
}

/// 批量提供服务定义
pub trait GrpcServiceDiscoverer {
    fn find_grpc_services(&self) -> Vec<ServiceDefinition>;
}

/// 请求处理的执行模型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorMode {
    /// 在调用方的运行时上直接处理
    Direct,
    /// 在独立的多线程运行时上处理
    WorkerPool { threads: usize },
}

impl ExecutorMode {
    pub fn from_config(config: &GrpcServerConfig) -> Self {
        if config.reactor || config.handle_worker_threads == 0 {
            ExecutorMode::Direct
        } else {
            ExecutorMode::WorkerPool {
                threads: config.handle_worker_threads,
            }
        }
    }
}

/// 独立的工作线程运行时，drop 时在后台关闭
struct WorkerPool {
    runtime: Option<Runtime>,
}

impl WorkerPool {
    fn build(threads: usize) -> Result<Self> {
        let seq = Arc::new(AtomicUsize::new(0));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(move || {
                let n = seq.fetch_add(1, Ordering::Relaxed);
                format!("{}{}", WORKER_THREAD_PREFIX, n)
            })
            .enable_all()
            .build()
            .map_err(|e| FlareError::system(format!("failed to build grpc worker pool: {}", e)))?;
        Ok(Self {
            runtime: Some(runtime),
        })
    }

    fn handle(&self) -> Option<tokio::runtime::Handle> {
        self.runtime.as_ref().map(|rt| rt.handle().clone())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// gRPC 服务器工厂
pub struct GrpcServerFactory {
    config: GrpcServerConfig,
    services: Vec<ServiceDefinition>,
}

impl GrpcServerFactory {
    pub fn new(config: GrpcServerConfig) -> Self {
        Self {
            config,
            services: Vec::new(),
        }
    }

    pub fn config(&self) -> &GrpcServerConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// 添加服务，重名在 `create_server` 时检查
    pub fn add_service(&mut self, service: ServiceDefinition) -> &mut Self {
        self.services.push(service);
        self
    }

    pub fn add_services_from(&mut self, discoverer: &dyn GrpcServiceDiscoverer) -> &mut Self {
        self.services.extend(discoverer.find_grpc_services());
        self
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name()).collect()
    }

    /// 监听地址
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.config.bind_address.trim().parse().map_err(|_| {
            FlareError::configuration_error(format!(
                "invalid server bind address: {}",
                self.config.bind_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.config.port))
    }

    /// 构建服务器
    ///
    /// 服务重名是配置错误，服务器不会被创建。
    pub fn create_server(self) -> Result<GrpcServer> {
        let addr = self.bind_addr()?;

        let mut seen = HashSet::new();
        for service in &self.services {
            if !seen.insert(service.name()) {
                return Err(FlareError::duplicate_service(service.name()));
            }
        }

        let names = self.service_names();
        let mut builder = RoutesBuilder::default();
        for service in self.services {
            info!(service = service.name(), "Start gRPC service");
            (service.install)(&mut builder);
        }

        let executor = ExecutorMode::from_config(&self.config);
        let worker_pool = match executor {
            ExecutorMode::Direct => None,
            ExecutorMode::WorkerPool { threads } => Some(WorkerPool::build(threads)?),
        };

        Ok(GrpcServer {
            addr,
            services: names,
            routes: builder.routes(),
            settings: ServerSettings::from(&self.config),
            executor,
            worker_pool,
        })
    }
}

/// 传输层参数
#[derive(Debug, Clone)]
struct ServerSettings {
    keep_alive: Option<(Duration, Duration)>,
    max_concurrent_streams: Option<u32>,
    grace_period: Duration,
}

impl From<&GrpcServerConfig> for ServerSettings {
    fn from(config: &GrpcServerConfig) -> Self {
        Self {
            keep_alive: config
                .enable_keep_alive
                .then(|| (config.keep_alive_time(), config.keep_alive_timeout())),
            max_concurrent_streams: config.max_concurrent_streams,
            grace_period: config.shutdown_grace_period(),
        }
    }
}

impl ServerSettings {
    fn builder(&self) -> Server {
        let mut server = Server::builder()
            .tcp_nodelay(true)
            .max_concurrent_streams(self.max_concurrent_streams);
        if let Some((interval, timeout)) = self.keep_alive {
            server = server
                .http2_keepalive_interval(Some(interval))
                .http2_keepalive_timeout(Some(timeout));
        }
        server
    }
}

/// 已配置好的 gRPC 服务器
pub struct GrpcServer {
    addr: SocketAddr,
    services: Vec<&'static str>,
    routes: Routes,
    settings: ServerSettings,
    executor: ExecutorMode,
    worker_pool: Option<WorkerPool>,
}

impl GrpcServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn services(&self) -> &[&'static str] {
        &self.services
    }

    pub fn executor(&self) -> ExecutorMode {
        self.executor
    }

    pub fn keep_alive(&self) -> Option<(Duration, Duration)> {
        self.settings.keep_alive
    }

    /// 启动并在收到 Ctrl+C 后优雅关闭
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for ctrl_c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// 启动并在 `signal` 完成后优雅关闭
    ///
    /// 关闭信号之后最多等待 `shutdown_grace_period`，仍未结束的连接被强制断开。
    pub async fn serve_with_shutdown<F>(mut self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.addr;
        let grace_period = self.settings.grace_period;
        let router = self.settings.builder().add_routes(self.routes);

        let (fired_tx, fired_rx) = oneshot::channel::<()>();
        let signal = async move {
            signal.await;
            info!(address = %addr, "Shutdown signal received, draining gRPC server");
            let _ = fired_tx.send(());
        };

        let serving = async move {
            let serve = router.serve_with_shutdown(addr, signal);
            tokio::pin!(serve);
            let forced = async move {
                match fired_rx.await {
                    Ok(()) => tokio::time::sleep(grace_period).await,
                    Err(_) => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                res = &mut serve => res.map_err(FlareError::from),
                _ = forced => {
                    warn!(
                        address = %addr,
                        grace_secs = grace_period.as_secs(),
                        "Grace period elapsed, forcing gRPC server shutdown"
                    );
                    Ok(())
                }
            }
        };

        info!(address = %addr, services = ?self.services, executor = ?self.executor, "gRPC server starting");
        let result = match self.worker_pool.as_ref().and_then(WorkerPool::handle) {
            None => serving.await,
            Some(handle) => handle
                .spawn(serving)
                .await
                .map_err(|e| FlareError::system(format!("grpc server task failed: {}", e)))?,
        };
        self.worker_pool.take();
        info!(address = %addr, "gRPC server stopped");
        result
    }
}

impl fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcServer")
            .field("addr", &self.addr)
            .field("services", &self.services)
            .field("executor", &self.executor)
            .field("keep_alive", &self.settings.keep_alive)
            .finish()
    }
}

//! Flare RPC Discovery
//!
//! 基于注册中心的 gRPC 连接层：
//!
//! - 服务端把自身实例注册到 etcd 并持续续约（[`server::ServiceRegistrar`]）
//! - 客户端把 `(name, version)` 解析为按权重分组的地址，
//!   在注册中心变化时自动刷新（[`resolver`]）
//! - channel 按注册键缓存，挂载拦截器链，关闭时等待在途调用（[`client::ChannelFactory`]）

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod interceptor;
pub mod resolver;
pub mod retry;
pub mod server;
pub mod telemetry;
pub mod utils;

pub use client::{ChannelFactory, ChannelOptions, ClientChannel, InterceptedChannel, ManagedChannel};
pub use config::{Config, EtcdConfig, GrpcClientConfig, GrpcServerConfig, LogConfig, LogFormat};
pub use discovery::{
    BackendType, ChangeNotifier, DiscoveryClient, DiscoveryFactory, EtcdDiscoveryClient,
    LeaseState, MemoryStore, Registration, RegistryEvent, ServiceEntity, ServiceKey,
};
pub use error::{ErrorCategory, ErrorCode, FlareError, Result};
pub use interceptor::{
    ClientInterceptor, InterceptorChain, InterceptorRegistry, LoggingInterceptor,
    TimeoutInterceptor, TracingInterceptor,
};
pub use resolver::{DiscoveryResolver, LoadBalancePolicy, ResolverProvider};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
pub use server::{
    ExecutorMode, GrpcServer, GrpcServerFactory, GrpcServiceDiscoverer, ServiceDefinition,
    ServiceRegistrar,
};
pub use telemetry::init_tracing;

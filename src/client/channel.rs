//! 受管 channel
//!
//! 每个注册键对应一个 [`ManagedChannel`]：一个 tonic 负载均衡 channel，
//! 加上驱动它的解析器。调用方拿到的是 [`ClientChannel`]，
//! 在受管 channel 外面套一层拦截器链并统计在途调用，用于优雅关闭。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tonic::body::Body;
use tonic::client::Grpc;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Channel;
use tower::{BoxError, Service};
use tracing::debug;

use super::ChannelOptions;
use crate::discovery::client::DiscoveryClient;
use crate::discovery::notifier::ChangeNotifier;
use crate::error::{FlareError, Result};
use crate::interceptor::InterceptorChain;
use crate::resolver::{BalanceListener, DiscoveryResolver, EndpointKey};

/// 调用计数与关闭标记，由受管 channel 与所有派生的 [`InterceptedChannel`] 共享
#[derive(Debug, Default)]
struct CallTracker {
    in_flight: AtomicUsize,
    shutdown: AtomicBool,
}

pub(crate) struct CallGuard(Arc<CallTracker>);

impl CallGuard {
    fn enter(tracker: &Arc<CallTracker>) -> Self {
        tracker.in_flight.fetch_add(1, Ordering::AcqRel);
        Self(tracker.clone())
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Inner {
    key: String,
    channel: Channel,
    resolver: Arc<DiscoveryResolver>,
    balance: Arc<BalanceListener>,
    start_task: Mutex<Option<JoinHandle<()>>>,
    tracker: Arc<CallTracker>,
    terminated: AtomicBool,
}

/// 受管 channel（克隆共享同一个连接）
#[derive(Clone)]
pub struct ManagedChannel {
    inner: Arc<Inner>,
}

impl ManagedChannel {
    /// 创建负载均衡 channel 与解析器，并在后台启动解析
    ///
    /// 必须在 tokio 运行时中调用。
    pub fn new(
        key: impl Into<String>,
        client: Arc<dyn DiscoveryClient>,
        notifier: Arc<ChangeNotifier>,
        options: &ChannelOptions,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| FlareError::system(format!("channel requires a tokio runtime: {}", e)))?;
        let key = key.into();

        let (channel, sender) = Channel::balance_channel::<EndpointKey>(options.balance_buffer);
        let balance = Arc::new(BalanceListener::new(
            sender,
            options.endpoint.clone(),
            options.policy,
        ));
        let resolver = Arc::new(DiscoveryResolver::new(
            key.clone(),
            client,
            balance.clone(),
            notifier,
        ));

        let start_task = {
            let resolver = resolver.clone();
            handle.spawn(async move { resolver.start().await })
        };
        debug!(key = %key, policy = %options.policy, "Managed channel created");

        Ok(Self {
            inner: Arc::new(Inner {
                key,
                channel,
                resolver,
                balance,
                start_task: Mutex::new(Some(start_task)),
                tracker: Arc::new(CallTracker::default()),
                terminated: AtomicBool::new(false),
            }),
        })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// 底层负载均衡 channel，不经过拦截器也不计入在途调用
    pub fn channel(&self) -> Channel {
        self.inner.channel.clone()
    }

    pub fn resolver(&self) -> &Arc<DiscoveryResolver> {
        &self.inner.resolver
    }

    pub fn balance(&self) -> &Arc<BalanceListener> {
        &self.inner.balance
    }

    pub fn in_flight(&self) -> usize {
        self.inner.tracker.in_flight.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.tracker.shutdown.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn enter_call(&self) -> CallGuard {
        CallGuard::enter(&self.inner.tracker)
    }

    /// 是否是同一个连接
    pub fn ptr_eq(&self, other: &ManagedChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 用拦截器链包装，返回可以直接交给生成客户端的服务
    pub fn intercepted(&self, interceptors: InterceptorChain) -> InterceptedChannel {
        InterceptedChannel {
            inner: InterceptedService::new(self.channel(), interceptors),
            tracker: self.inner.tracker.clone(),
        }
    }

    /// 请求关闭：拒绝新调用、停止解析，在途调用继续执行
    pub async fn shutdown(&self) {
        if self.inner.tracker.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.resolver.shutdown().await;

        let start_task = self
            .inner
            .start_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = start_task {
            task.abort();
        }
        debug!(key = %self.inner.key, in_flight = self.in_flight(), "Channel shutdown requested");
    }

    /// 已请求关闭且没有在途调用时完成终止
    pub async fn try_terminate(&self) -> bool {
        if self.is_terminated() {
            return true;
        }
        if !self.is_shutdown() || self.in_flight() > 0 {
            return false;
        }
        self.terminate().await;
        true
    }

    /// 立即终止，不等待在途调用
    pub async fn shutdown_now(&self) {
        self.shutdown().await;
        self.terminate().await;
    }

    async fn terminate(&self) {
        self.inner.balance.close().await;
        self.inner.terminated.store(true, Ordering::Release);
        debug!(key = %self.inner.key, "Channel terminated");
    }
}

impl fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("key", &self.inner.key)
            .field("in_flight", &self.in_flight())
            .field("shutdown", &self.is_shutdown())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// 带拦截器与调用计数的 channel 服务
#[derive(Clone)]
pub struct InterceptedChannel {
    inner: InterceptedService<Channel, InterceptorChain>,
    tracker: Arc<CallTracker>,
}

impl Service<http::Request<Body>> for InterceptedChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        if self.tracker.shutdown.load(Ordering::Acquire) {
            let err = BoxError::from(FlareError::already_closed("ManagedChannel"));
            return Box::pin(async move { Err(err) });
        }

        let guard = CallGuard::enter(&self.tracker);
        let fut = self.inner.call(req);
        Box::pin(async move {
            let res = fut.await;
            drop(guard);
            res.map(|response| response.map(Body::new)).map_err(BoxError::from)
        })
    }
}

/// `create_channel` 返回的 channel
#[derive(Clone)]
pub struct ClientChannel {
    managed: ManagedChannel,
    interceptors: InterceptorChain,
    max_decoding_message_size: usize,
}

impl ClientChannel {
    pub(crate) fn new(
        managed: ManagedChannel,
        interceptors: InterceptorChain,
        max_decoding_message_size: usize,
    ) -> Self {
        Self {
            managed,
            interceptors,
            max_decoding_message_size,
        }
    }

    pub fn key(&self) -> &str {
        self.managed.key()
    }

    pub fn managed(&self) -> &ManagedChannel {
        &self.managed
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    pub fn max_decoding_message_size(&self) -> usize {
        self.max_decoding_message_size
    }

    /// 带拦截器的底层服务
    ///
    /// 直接交给生成客户端时使用 tonic 默认的入站消息上限，
    /// 需要配置的上限时改用 [`ClientChannel::client`]。
    pub fn service(&self) -> InterceptedChannel {
        self.managed.intercepted(self.interceptors.clone())
    }

    /// 构造生成客户端，`build` 收到服务与入站消息上限
    ///
    /// ```ignore
    /// let client = channel.client(|service, limit| {
    ///     GreeterClient::new(service).max_decoding_message_size(limit)
    /// });
    /// ```
    pub fn client<C, F>(&self, build: F) -> C
    where
        F: FnOnce(InterceptedChannel, usize) -> C,
    {
        build(self.service(), self.max_decoding_message_size)
    }

    /// 已设置最大入站消息大小的通用 gRPC 客户端
    pub fn grpc(&self) -> Grpc<InterceptedChannel> {
        Grpc::new(self.service()).max_decoding_message_size(self.max_decoding_message_size)
    }
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("managed", &self.managed)
            .field("interceptors", &self.interceptors)
            .field("max_decoding_message_size", &self.max_decoding_message_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::client::ZookeeperDiscoveryClient;
    use crate::config::ZookeeperConfig;

    fn managed() -> ManagedChannel {
        let client = Arc::new(ZookeeperDiscoveryClient::new(&ZookeeperConfig::default()));
        ManagedChannel::new(
            "/services/a/v1/grpc/",
            client,
            Arc::new(ChangeNotifier::new()),
            &ChannelOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_terminate_waits_for_in_flight_calls() {
        let channel = managed();
        let guard = CallGuard::enter(&channel.inner.tracker);

        assert!(!channel.try_terminate().await);
        channel.shutdown().await;
        assert!(channel.is_shutdown());
        assert!(!channel.try_terminate().await);

        drop(guard);
        assert!(channel.try_terminate().await);
        assert!(channel.is_terminated());
        assert!(channel.balance().is_closed().await);
    }

    #[tokio::test]
    async fn test_shutdown_now_ignores_in_flight_calls() {
        let channel = managed();
        let _guard = CallGuard::enter(&channel.inner.tracker);

        channel.shutdown_now().await;
        assert!(channel.is_terminated());
        assert!(channel.resolver().is_shutdown());
        assert_eq!(channel.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_rejected() {
        let channel = managed();
        channel.shutdown().await;

        let mut service = channel.intercepted(InterceptorChain::default());
        let err = service
            .call(http::Request::new(Body::empty()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already closed"));
    }

    #[tokio::test]
    async fn test_client_receives_decoding_limit() {
        struct GeneratedClient {
            limit: Option<usize>,
        }

        impl GeneratedClient {
            fn new(_service: InterceptedChannel) -> Self {
                Self { limit: None }
            }

            fn max_decoding_message_size(mut self, limit: usize) -> Self {
                self.limit = Some(limit);
                self
            }
        }

        let channel = ClientChannel::new(
            managed(),
            InterceptorChain::default(),
            crate::config::DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
        );
        let client = channel.client(|service, limit| {
            GeneratedClient::new(service).max_decoding_message_size(limit)
        });
        assert_eq!(client.limit, Some(50 * 1024 * 1024));
    }

    #[test]
    fn test_intercepted_channel_is_grpc_service() {
        fn assert_grpc_service<T: tonic::client::GrpcService<Body>>() {}
        assert_grpc_service::<InterceptedChannel>();
    }

    #[test]
    fn test_requires_runtime() {
        let client = Arc::new(ZookeeperDiscoveryClient::new(&ZookeeperConfig::default()));
        let result = ManagedChannel::new(
            "/services/a/v1/grpc/",
            client,
            Arc::new(ChangeNotifier::new()),
            &ChannelOptions::default(),
        );
        assert!(result.is_err());
    }
}

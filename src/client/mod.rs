//! gRPC 客户端模块
//!
//! [`ChannelFactory`] 按注册键缓存 channel，同一个 `(name, version)` 始终复用同一个连接；
//! 关闭时等待在途调用完成，超过宽限期后强制终止。

pub mod channel;

pub use channel::{ClientChannel, InterceptedChannel, ManagedChannel};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::config::{DEFAULT_MAX_INBOUND_MESSAGE_SIZE, GrpcClientConfig};
use crate::discovery::client::DiscoveryClient;
use crate::discovery::key::ServiceKey;
use crate::discovery::notifier::ChangeNotifier;
use crate::error::{FlareError, Result};
use crate::interceptor::{InterceptorRegistry, TimeoutInterceptor, TracingInterceptor};
use crate::resolver::{EndpointTemplate, LoadBalancePolicy};

/// 关闭时轮询终止状态的间隔
const TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// channel 参数
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub policy: LoadBalancePolicy,
    pub endpoint: EndpointTemplate,
    pub max_decoding_message_size: usize,
    pub shutdown_grace_period: Duration,
    /// 负载均衡 channel 变更队列长度
    pub balance_buffer: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            policy: LoadBalancePolicy::RoundRobin,
            endpoint: EndpointTemplate {
                connect_timeout: Duration::from_secs(5),
                keep_alive: None,
            },
            max_decoding_message_size: DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
            shutdown_grace_period: Duration::from_secs(60),
            balance_buffer: 1024,
        }
    }
}

impl ChannelOptions {
    pub fn from_config(config: &GrpcClientConfig) -> Result<Self> {
        let policy = config
            .default_load_balancing_policy
            .parse::<LoadBalancePolicy>()
            .map_err(FlareError::configuration_error)?;
        Ok(Self {
            policy,
            endpoint: EndpointTemplate::from(config),
            max_decoding_message_size: config.max_inbound_message_size,
            shutdown_grace_period: config.shutdown_grace_period(),
            ..Self::default()
        })
    }
}

const OPEN: u8 = 0;
const SERVING: u8 = 1;
const CLOSED: u8 = 2;

/// gRPC channel 工厂
pub struct ChannelFactory {
    client: Arc<dyn DiscoveryClient>,
    notifier: Arc<ChangeNotifier>,
    interceptors: Arc<InterceptorRegistry>,
    options: ChannelOptions,
    /// 创建 channel 持读锁，关闭持写锁
    gate: RwLock<()>,
    lifecycle: AtomicU8,
    channels: DashMap<String, ManagedChannel>,
}

impl ChannelFactory {
    /// 使用全局拦截器列表
    pub fn new(
        client: Arc<dyn DiscoveryClient>,
        notifier: Arc<ChangeNotifier>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            client,
            notifier,
            interceptors: InterceptorRegistry::global(),
            options,
            gate: RwLock::new(()),
            lifecycle: AtomicU8::new(OPEN),
            channels: DashMap::new(),
        }
    }

    /// 从配置创建，使用独立的拦截器列表（预置超时与追踪拦截器）
    pub fn from_config(
        config: &GrpcClientConfig,
        client: Arc<dyn DiscoveryClient>,
        notifier: Arc<ChangeNotifier>,
    ) -> Result<Self> {
        let interceptors = Arc::new(InterceptorRegistry::new());
        interceptors.register(Arc::new(TimeoutInterceptor::new(config.timeout())));
        interceptors.register(Arc::new(TracingInterceptor::new()));

        Ok(Self::new(client, notifier, ChannelOptions::from_config(config)?)
            .with_interceptors(interceptors))
    }

    pub fn with_interceptors(mut self, interceptors: Arc<InterceptorRegistry>) -> Self {
        self.interceptors = interceptors;
        self
    }

    pub fn interceptors(&self) -> &Arc<InterceptorRegistry> {
        &self.interceptors
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// 获取（或创建）服务的 channel
    pub fn create_channel(&self, name: &str, version: &str) -> Result<ClientChannel> {
        let key = ServiceKey::grpc(name, version)?.to_string();

        let managed = {
            let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                return Err(FlareError::already_closed("GrpcChannelFactory"));
            }

            let managed = match self.channels.entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let managed = ManagedChannel::new(
                        key.clone(),
                        self.client.clone(),
                        self.notifier.clone(),
                        &self.options,
                    )?;
                    info!(key = %key, "Created channel");
                    entry.insert(managed.clone());
                    managed
                }
            };
            let _ = self
                .lifecycle
                .compare_exchange(OPEN, SERVING, Ordering::AcqRel, Ordering::Acquire);
            managed
        };

        Ok(ClientChannel::new(
            managed,
            self.interceptors.snapshot(),
            self.options.max_decoding_message_size,
        ))
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == CLOSED
    }

    /// 缓存中的 channel 数量
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// 关闭全部 channel，返回关闭的数量；重复调用返回 0
    pub async fn close(&self) -> usize {
        {
            let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
            if self.lifecycle.swap(CLOSED, Ordering::AcqRel) == CLOSED {
                return 0;
            }
        }

        let channels: Vec<ManagedChannel> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in &channels {
            channel.shutdown().await;
        }

        let deadline = Instant::now() + self.options.shutdown_grace_period;
        for channel in &channels {
            let mut waited = 0u64;
            while !channel.try_terminate().await {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                debug!(
                    key = %channel.key(),
                    waited_secs = waited,
                    in_flight = channel.in_flight(),
                    "Awaiting channel termination"
                );
                sleep(TERMINATION_POLL_INTERVAL.min(deadline - now)).await;
                waited += 1;
            }
        }

        for channel in &channels {
            if !channel.is_terminated() {
                debug!(key = %channel.key(), "Channel not terminated yet, force shutdown now");
                channel.shutdown_now().await;
            }
        }

        let count = channels.len();
        self.channels.clear();
        info!(count, "GrpcChannelFactory closed");
        count
    }
}

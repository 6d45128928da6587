//! 名称解析
//!
//! [`DiscoveryResolver`] 把一个注册键前缀解析成按权重分组的地址列表，
//! 并在注册中心变化时重新解析。解析结果交给 [`ResolutionListener`]，
//! 通常是把地址同步到 tonic 负载均衡 channel 的 [`BalanceListener`]。

pub mod balance;
pub mod provider;

pub use balance::{BalanceListener, EndpointKey, EndpointTemplate, LoadBalancePolicy};
pub use provider::{DEFAULT_SCHEME, ResolverProvider};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::client::DiscoveryClient;
use crate::discovery::entity::ServiceEntity;
use crate::discovery::notifier::{ChangeListener, ChangeNotifier, RegistryEvent, SubscriptionId};

/// 后端地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
}

impl EndpointAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn to_uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 同一权重下的地址组
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressGroup {
    pub weight: u32,
    pub addresses: BTreeSet<EndpointAddress>,
}

/// 一次解析结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionUpdate {
    /// 按权重从高到低排列
    pub groups: Vec<AddressGroup>,
    pub metadata: HashMap<String, String>,
}

impl ResolutionUpdate {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn address_count(&self) -> usize {
        self.groups.iter().map(|g| g.addresses.len()).sum()
    }
}

/// 解析结果接收方
#[async_trait]
pub trait ResolutionListener: Send + Sync {
    async fn on_addresses(&self, update: ResolutionUpdate);
}

/// 按权重分组，权重高的组排在前面
pub fn group_by_weight(entities: &HashSet<ServiceEntity>) -> Vec<AddressGroup> {
    let mut groups: BTreeMap<u32, BTreeSet<EndpointAddress>> = BTreeMap::new();
    for entity in entities {
        groups
            .entry(entity.lb_weight())
            .or_default()
            .insert(EndpointAddress::new(entity.host(), entity.port()));
    }
    groups
        .into_iter()
        .rev()
        .map(|(weight, addresses)| AddressGroup { weight, addresses })
        .collect()
}

const IDLE: u8 = 0;
const RESOLVING: u8 = 1;

/// 注册中心名称解析器
///
/// 同一时刻最多只有一次解析在执行；执行期间到达的刷新请求合并为一次后续解析。
pub struct DiscoveryResolver {
    key: String,
    client: Arc<dyn DiscoveryClient>,
    listener: Arc<dyn ResolutionListener>,
    notifier: Arc<ChangeNotifier>,
    state: AtomicU8,
    pending: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    /// 是否持有注册中心监听的引用
    watch_held: Mutex<bool>,
    shutdown: CancellationToken,
}

/// 通知器持有弱引用，解析器被释放后订阅自动失效
struct RefreshOnChange(Weak<DiscoveryResolver>);

#[async_trait]
impl ChangeListener for RefreshOnChange {
    async fn on_change(&self, event: RegistryEvent) {
        if let Some(resolver) = self.0.upgrade() {
            debug!(key = %resolver.key, prefix = event.prefix(), "Registry changed, refreshing");
            resolver.refresh().await;
        }
    }
}

impl DiscoveryResolver {
    pub fn new(
        key: impl Into<String>,
        client: Arc<dyn DiscoveryClient>,
        listener: Arc<dyn ResolutionListener>,
        notifier: Arc<ChangeNotifier>,
    ) -> Self {
        Self {
            key: key.into(),
            client,
            listener,
            notifier,
            state: AtomicU8::new(IDLE),
            pending: AtomicBool::new(false),
            subscription: Mutex::new(None),
            watch_held: Mutex::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 启动解析：订阅变更、立即解析一次、开始监听注册中心
    pub async fn start(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        {
            let mut subscription = self
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if subscription.is_some() {
                return;
            }
            let listener = Arc::new(RefreshOnChange(Arc::downgrade(self)));
            *subscription = Some(self.notifier.subscribe(listener));
        }

        self.refresh().await;

        // 监听建立可能较慢，不阻塞首次解析的结果发布
        let resolver = self.clone();
        tokio::spawn(async move { resolver.hold_watch().await });
    }

    async fn hold_watch(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.client.watch(&self.key).await;

        // shutdown 在 watch 返回前完成时由这里释放监听
        let release = {
            let mut held = self.watch_held.lock().unwrap_or_else(PoisonError::into_inner);
            if self.shutdown.is_cancelled() {
                true
            } else {
                *held = true;
                false
            }
        };
        if release {
            debug!(key = %self.key, "Resolver shut down while watching, releasing watch");
            self.client.unwatch(&self.key).await;
        }
    }

    /// 请求一次解析
    ///
    /// 已有解析在执行时只标记待处理，由正在执行的那次在结束前补做一轮。
    pub async fn refresh(&self) {
        self.pending.store(true, Ordering::Release);
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }
            if self
                .state
                .compare_exchange(IDLE, RESOLVING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            while self.pending.swap(false, Ordering::AcqRel) {
                if self.shutdown.is_cancelled() {
                    break;
                }
                self.resolve_once().await;
            }
            self.state.store(IDLE, Ordering::Release);

            // 在最后一次 swap 与回到 IDLE 之间到达的请求
            if !self.pending.load(Ordering::Acquire) {
                return;
            }
        }
    }

    async fn resolve_once(&self) -> ResolutionUpdate {
        let services = self.client.find_services(&self.key).await;
        let update = ResolutionUpdate {
            groups: group_by_weight(&services),
            metadata: HashMap::new(),
        };

        if update.is_empty() {
            warn!(key = %self.key, "Found no services");
        } else {
            info!(
                key = %self.key,
                hosts = update.address_count(),
                groups = update.groups.len(),
                "Found services"
            );
        }

        if !self.shutdown.is_cancelled() {
            self.listener.on_addresses(update.clone()).await;
        }
        update
    }

    /// 当前是否处于解析中
    pub fn is_resolving(&self) -> bool {
        self.state.load(Ordering::Acquire) == RESOLVING
    }

    /// 监听多次重新订阅失败，地址可能已过期
    pub fn is_stale(&self) -> bool {
        self.client
            .watch_status(&self.key)
            .is_some_and(|status| status.is_stale())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 停止解析：取消订阅并释放监听
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = subscription {
            self.notifier.unsubscribe(id);
        }

        let held = std::mem::take(
            &mut *self.watch_held.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if held {
            self.client.unwatch(&self.key).await;
        }
        debug!(key = %self.key, "Resolver shut down");
    }
}

//! 注册中心客户端
//!
//! 服务端通过 [`DiscoveryClient::register_and_keep_alive`] 注册自身并持续续约，
//! 客户端通过 [`DiscoveryClient::find_services`] 查询、[`DiscoveryClient::watch`] 监听变化。

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::entity::ServiceEntity;
use super::watch::WatchStatus;
use crate::config::EtcdConfig;
use crate::error::Result;

mod etcd;
mod keeper;
mod zookeeper;

pub use etcd::EtcdDiscoveryClient;
pub use zookeeper::ZookeeperDiscoveryClient;

/// 注册中心后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Etcd,
    Zookeeper,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Etcd => write!(f, "etcd"),
            BackendType::Zookeeper => write!(f, "zookeeper"),
        }
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "etcd" => Ok(BackendType::Etcd),
            "zookeeper" | "zk" => Ok(BackendType::Zookeeper),
            _ => Err(format!("Unknown backend type: {}", s)),
        }
    }
}

/// 租约参数
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// 租约 TTL
    pub ttl: Duration,
    /// 续约间隔，必须小于 TTL
    pub renew_interval: Duration,
    /// 单次租约申请超时
    pub grant_timeout: Duration,
    /// 租约申请最大尝试次数
    pub max_grant_attempts: usize,
    /// 两次租约申请之间的间隔
    pub grant_retry_delay: Duration,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(9),
            grant_timeout: Duration::from_secs(5),
            max_grant_attempts: 5,
            grant_retry_delay: Duration::from_millis(100),
        }
    }
}

impl From<&EtcdConfig> for LeaseOptions {
    fn from(config: &EtcdConfig) -> Self {
        Self {
            ttl: config.lease_ttl(),
            renew_interval: config.renew_interval(),
            ..Self::default()
        }
    }
}

/// 注册状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// 尚未写入或最近一次写入失败
    Unregistered,
    /// 已写入并绑定租约
    Leased { lease_id: i64 },
    /// 租约申请失败，键以无租约方式写入，进程退出后不会自动过期
    Unleased,
    /// 已注销
    Stopped,
}

impl LeaseState {
    pub fn lease_id(&self) -> Option<i64> {
        match self {
            LeaseState::Leased { lease_id } => Some(*lease_id),
            _ => None,
        }
    }
}

/// 注册句柄，可查询并等待注册状态变化
#[derive(Debug, Clone)]
pub struct Registration {
    key: String,
    state: watch::Receiver<LeaseState>,
}

impl Registration {
    pub(crate) fn new(key: impl Into<String>, state: watch::Receiver<LeaseState>) -> Self {
        Self {
            key: key.into(),
            state,
        }
    }

    /// 不会再变化的注册句柄
    pub(crate) fn fixed(key: impl Into<String>, state: LeaseState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self::new(key, rx)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> LeaseState {
        *self.state.borrow()
    }

    /// 没有处于租约保护下（无租约、未注册或已停止）
    pub fn is_degraded(&self) -> bool {
        !matches!(self.state(), LeaseState::Leased { .. })
    }

    /// 等待状态满足条件
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> LeaseState
    where
        F: FnMut(&LeaseState) -> bool,
    {
        let matched = self
            .state
            .wait_for(|state| predicate(state))
            .await
            .map(|state| *state)
            .ok();
        // 续约任务已退出时返回最后的状态
        matched.unwrap_or_else(|| *self.state.borrow())
    }
}

/// 注册中心客户端
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// 注册 `key -> value` 并在后台持续续约
    ///
    /// 失败不会返回给调用方，只记录日志并在下一个续约周期重试；
    /// 对同一个键重复调用会替换之前的注册，同一时刻每个键只有一个有效租约。
    async fn register_and_keep_alive(&self, key: &str, value: &str) -> Registration;

    /// 查询前缀下的所有服务实体，注册中心不可用时返回空集合
    async fn find_services(&self, key_prefix: &str) -> HashSet<ServiceEntity>;

    /// 开始监听前缀，变化通过 [`ChangeNotifier`](super::notifier::ChangeNotifier) 发布
    async fn watch(&self, key_prefix: &str);

    /// 释放一次 `watch`，引用归零后停止监听
    async fn unwatch(&self, _key_prefix: &str) {}

    fn watch_status(&self, _key_prefix: &str) -> Option<Arc<WatchStatus>> {
        None
    }

    /// 停止续约并删除注册键
    async fn deregister(&self, key: &str) -> Result<()>;

    /// 注销全部注册并停止所有监听
    async fn close(&self);
}

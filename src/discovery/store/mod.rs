//! 注册中心存储抽象
//!
//! 注册客户端只依赖这里定义的租约 + 键值 + 前缀监听语义，
//! etcd 与内存实现都满足同一组约定：
//!
//! - 租约撤销或过期时，绑定在该租约上的键一并删除
//! - 对已过期的租约续约返回剩余 TTL 为 0
//! - 前缀监听的一次响应可能包含多条事件

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// 键值对
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// 监听事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
}

/// 一次监听响应中的事件集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
}

/// 前缀监听流；流结束或产生错误都意味着需要重新订阅
pub type WatchStream = BoxStream<'static, Result<WatchBatch>>;

/// 注册中心存储
#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// 申请租约，返回租约 ID
    async fn lease_grant(&self, ttl: Duration) -> Result<i64>;

    /// 续约一次，返回剩余 TTL（秒）；租约已失效时返回 0
    async fn lease_keep_alive_once(&self, lease_id: i64) -> Result<i64>;

    async fn lease_revoke(&self, lease_id: i64) -> Result<()>;

    /// 写入键值，可选绑定租约
    async fn put(&self, key: &str, value: &str, lease_id: Option<i64>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// 前缀查询
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// 前缀监听
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;
}

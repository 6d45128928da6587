//! 服务注册与发现模块
//!
//! - [`entity`] / [`key`]：注册值与注册键的格式
//! - [`store`]：注册中心存储抽象（etcd / 内存）
//! - [`client`]：注册、续约、查询与监听
//! - [`notifier`]：注册中心变更的进程内广播
//! - [`watch`]：前缀监听守护与状态

pub mod client;
pub mod entity;
pub mod factory;
pub mod key;
pub mod notifier;
pub mod store;
pub mod watch;

pub use client::{
    BackendType, DiscoveryClient, EtcdDiscoveryClient, LeaseOptions, LeaseState, Registration,
    ZookeeperDiscoveryClient,
};
pub use entity::ServiceEntity;
pub use factory::DiscoveryFactory;
pub use key::{Protocol, SERVICE_PREFIX, ServiceKey};
pub use notifier::{ChangeListener, ChangeNotifier, RegistryEvent, SubscriptionId};
pub use store::{MemoryStore, RegistryStore};
pub use watch::WatchStatus;

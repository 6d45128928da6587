//! ZooKeeper 注册中心客户端（占位）
//!
//! 目前只保留接口形态：注册与监听不做任何事，查询始终返回空集合。

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::warn;

use super::{BackendType, DiscoveryClient, LeaseState, Registration};
use crate::config::ZookeeperConfig;
use crate::discovery::entity::ServiceEntity;
use crate::error::Result;

pub struct ZookeeperDiscoveryClient {
    connect_string: String,
}

impl ZookeeperDiscoveryClient {
    pub fn new(config: &ZookeeperConfig) -> Self {
        warn!(
            connect_string = %config.connect_string,
            "ZooKeeper discovery client is not implemented, registrations will be ignored"
        );
        Self {
            connect_string: config.connect_string.clone(),
        }
    }

    pub fn connect_string(&self) -> &str {
        &self.connect_string
    }
}

#[async_trait]
impl DiscoveryClient for ZookeeperDiscoveryClient {
    fn backend_type(&self) -> BackendType {
        BackendType::Zookeeper
    }

    async fn register_and_keep_alive(&self, key: &str, _value: &str) -> Registration {
        warn!(key, "ZooKeeper registration is not supported");
        Registration::fixed(key, LeaseState::Unregistered)
    }

    async fn find_services(&self, key_prefix: &str) -> HashSet<ServiceEntity> {
        warn!(prefix = key_prefix, "ZooKeeper discovery is not supported");
        HashSet::new()
    }

    async fn watch(&self, key_prefix: &str) {
        warn!(prefix = key_prefix, "ZooKeeper watch is not supported");
    }

    async fn deregister(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}

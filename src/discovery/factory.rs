//! 注册中心客户端工厂
//!
//! 根据配置创建注册中心客户端，配置了哪个后端就创建哪个，两者都配置时同时注册到两处。

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::discovery::client::{DiscoveryClient, ZookeeperDiscoveryClient};
use crate::discovery::notifier::ChangeNotifier;
use crate::error::{FlareError, Result};

/// 注册中心客户端工厂
pub struct DiscoveryFactory;

impl DiscoveryFactory {
    /// 创建配置中声明的全部注册中心客户端
    pub async fn create_clients(
        config: &Config,
        notifier: Arc<ChangeNotifier>,
    ) -> Result<Vec<Arc<dyn DiscoveryClient>>> {
        let mut clients: Vec<Arc<dyn DiscoveryClient>> = Vec::new();

        if let Some(etcd) = &config.etcd {
            clients.push(Self::create_etcd(etcd, notifier.clone()).await?);
        }
        if let Some(zookeeper) = &config.zookeeper {
            clients.push(Arc::new(ZookeeperDiscoveryClient::new(zookeeper)));
        }

        if clients.is_empty() {
            return Err(FlareError::configuration_error(
                "no registry configured, expected [etcd] or [zookeeper]",
            ));
        }
        info!(
            backends = ?clients.iter().map(|c| c.backend_type()).collect::<Vec<_>>(),
            "Discovery clients created"
        );
        Ok(clients)
    }

    /// 创建客户端侧使用的主注册中心客户端（优先 etcd）
    pub async fn create_primary(
        config: &Config,
        notifier: Arc<ChangeNotifier>,
    ) -> Result<Arc<dyn DiscoveryClient>> {
        let mut clients = Self::create_clients(config, notifier).await?;
        Ok(clients.remove(0))
    }

    #[cfg(feature = "etcd")]
    async fn create_etcd(
        config: &crate::config::EtcdConfig,
        notifier: Arc<ChangeNotifier>,
    ) -> Result<Arc<dyn DiscoveryClient>> {
        let client = crate::discovery::client::EtcdDiscoveryClient::connect(config, notifier).await?;
        Ok(Arc::new(client))
    }

    #[cfg(not(feature = "etcd"))]
    async fn create_etcd(
        _config: &crate::config::EtcdConfig,
        _notifier: Arc<ChangeNotifier>,
    ) -> Result<Arc<dyn DiscoveryClient>> {
        Err(FlareError::configuration_error(
            "etcd registry configured but the `etcd` feature is disabled",
        ))
    }
}

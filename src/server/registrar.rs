//! 服务注册
//!
//! 服务器启动后，把本实例（本机地址、端口、权重、环境）注册到每个注册中心客户端，
//! 注册失败只记录日志，续约与重试由注册中心客户端负责。

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::GrpcServerConfig;
use crate::discovery::client::{DiscoveryClient, Registration};
use crate::discovery::entity::ServiceEntity;
use crate::discovery::key::ServiceKey;
use crate::error::Result;
use crate::utils::{host_ip, wait_for_server_ready};

/// 服务注册器
pub struct ServiceRegistrar {
    clients: Vec<Arc<dyn DiscoveryClient>>,
    name: String,
    version: String,
    host: String,
    port: u16,
    lb_weight: u32,
    env: Option<String>,
}

impl ServiceRegistrar {
    /// 主机地址取自 [`host_ip`]
    pub fn new(config: &GrpcServerConfig, clients: Vec<Arc<dyn DiscoveryClient>>) -> Self {
        Self {
            clients,
            name: config.name.clone(),
            version: config.version.clone(),
            host: host_ip(),
            port: config.port,
            lb_weight: config.lb_weight(),
            env: config.env.clone(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 服务键，客户端按它做前缀查询
    pub fn service_key(&self) -> Result<ServiceKey> {
        ServiceKey::grpc(&self.name, &self.version)
    }

    /// 本实例的注册键：服务键后接 `host:port`，同一服务的多个实例互不覆盖
    pub fn key(&self) -> Result<String> {
        Ok(format!("{}{}:{}", self.service_key()?, self.host, self.port))
    }

    /// 注册值（JSON 编码的服务实体）
    pub fn value(&self) -> Result<String> {
        ServiceEntity::from_parts(
            &self.host,
            self.port,
            i64::from(self.lb_weight),
            self.env.clone(),
        )?
        .to_registry_value()
    }

    /// 向每个注册中心客户端注册本实例
    ///
    /// 键或值无法生成时不注册，返回空列表。
    pub async fn register(&self) -> Vec<Registration> {
        let (key, value) = match self.key().and_then(|key| Ok((key, self.value()?))) {
            Ok(kv) => kv,
            Err(e) => {
                error!(
                    service = %self.name,
                    version = %self.version,
                    error = %e,
                    "Failed to build service registration"
                );
                return Vec::new();
            }
        };

        let mut registrations = Vec::with_capacity(self.clients.len());
        for client in &self.clients {
            let registration = client.register_and_keep_alive(&key, &value).await;
            info!(
                backend = %client.backend_type(),
                key = %key,
                value = %value,
                state = ?registration.state(),
                "Registered service instance"
            );
            registrations.push(registration);
        }
        registrations
    }

    /// 等待服务可以接受连接后注册
    pub async fn register_when_ready(&self, address: SocketAddr) -> Result<Vec<Registration>> {
        wait_for_server_ready(address).await?;
        Ok(self.register().await)
    }

    /// 从每个注册中心客户端注销本实例
    pub async fn deregister(&self) {
        let key = match self.key() {
            Ok(key) => key,
            Err(_) => return,
        };
        for client in &self.clients {
            if let Err(e) = client.deregister(&key).await {
                warn!(backend = %client.backend_type(), key = %key, error = %e, "Failed to deregister service");
            }
        }
    }
}

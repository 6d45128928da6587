//! 配置模块
//!
//! 所有配置都可以从 TOML 文件加载，每个字段都有默认值。
//! 部署相关的值可以被环境变量覆盖：
//! - `ETCD_ENDPOINTS`：逗号分隔的 etcd 地址
//! - `HOST_MACHINE_IP`：注册到注册中心的本机地址（见 [`crate::utils::host_ip`]）
//! - `APP_ENV`：实例的环境标签

use crate::error::{FlareError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认最大入站消息大小：50M
pub const DEFAULT_MAX_INBOUND_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub etcd: Option<EtcdConfig>,
    pub zookeeper: Option<ZookeeperConfig>,
    pub client: GrpcClientConfig,
    pub server: GrpcServerConfig,
    pub log: LogConfig,
}

/// etcd 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// 租约 TTL（秒）
    pub lease_ttl_secs: u64,
    /// etcd IO 超时（秒）
    pub timeout_secs: u64,
    /// 续约间隔（秒），必须小于 `lease_ttl_secs`
    pub renew_interval_secs: u64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            lease_ttl_secs: 10,
            timeout_secs: 10,
            renew_interval_secs: 9,
        }
    }
}

impl EtcdConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }
}

/// ZooKeeper 注册中心配置（占位）
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ZookeeperConfig {
    pub connect_string: String,
}

/// gRPC 客户端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GrpcClientConfig {
    /// 每次调用的超时（毫秒），由超时拦截器使用
    pub timeout_ms: u64,
    pub connect_timeout_secs: u64,
    /// 默认负载均衡策略：round_robin、weighted_round_robin、pick_first
    pub default_load_balancing_policy: String,
    pub enable_keep_alive: bool,
    pub keep_alive_time_secs: u64,
    pub keep_alive_timeout_secs: u64,
    pub keep_alive_without_calls: bool,
    pub max_inbound_message_size: usize,
    /// 关闭 channel 工厂时等待连接终止的最长时间（秒）
    pub shutdown_grace_period_secs: u64,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            connect_timeout_secs: 5,
            default_load_balancing_policy: "round_robin".to_string(),
            enable_keep_alive: false,
            keep_alive_time_secs: 300,
            keep_alive_timeout_secs: 5,
            keep_alive_without_calls: false,
            max_inbound_message_size: DEFAULT_MAX_INBOUND_MESSAGE_SIZE,
            shutdown_grace_period_secs: 60,
        }
    }
}

impl GrpcClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_secs(self.keep_alive_time_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// gRPC 服务端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GrpcServerConfig {
    pub name: String,
    pub version: String,
    pub port: u16,
    pub bind_address: String,
    /// 为 true 时在调用方运行时上直接分发请求，否则使用固定大小的工作线程池
    pub reactor: bool,
    pub handle_worker_threads: usize,
    /// 负载均衡权重，取值 1-10
    pub lb_weight: i32,
    pub env: Option<String>,
    pub shutdown_grace_period_secs: u64,
    pub enable_keep_alive: bool,
    pub keep_alive_time_secs: u64,
    pub keep_alive_timeout_secs: u64,
    pub max_concurrent_streams: Option<u32>,
}

impl Default for GrpcServerConfig {
    fn default() -> Self {
        Self {
            name: "default-server-name".to_string(),
            version: "v1.0".to_string(),
            port: 9090,
            bind_address: "0.0.0.0".to_string(),
            reactor: false,
            handle_worker_threads: 100,
            lb_weight: 10,
            env: None,
            shutdown_grace_period_secs: 30,
            enable_keep_alive: true,
            keep_alive_time_secs: 300,
            keep_alive_timeout_secs: 120,
            max_concurrent_streams: Some(1000),
        }
    }
}

impl GrpcServerConfig {
    /// 权重被限制在 [1, 10]
    pub fn lb_weight(&self) -> u32 {
        crate::discovery::entity::clamp_weight(i64::from(self.lb_weight))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_secs(self.keep_alive_time_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }
}

/// 日志输出格式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// `RUST_LOG` 未设置时使用的过滤规则
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 解析 TOML，应用环境变量覆盖并校验
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoints) = std::env::var("ETCD_ENDPOINTS") {
            let endpoints: Vec<String> = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !endpoints.is_empty() {
                self.etcd.get_or_insert_with(EtcdConfig::default).endpoints = endpoints;
            }
        }
        if self.server.env.is_none() {
            self.server.env = std::env::var("APP_ENV").ok().filter(|v| !v.is_empty());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(etcd) = &self.etcd {
            if etcd.endpoints.is_empty() {
                return Err(FlareError::configuration_error("etcd endpoints not configured"));
            }
            if etcd.renew_interval_secs == 0 || etcd.renew_interval_secs >= etcd.lease_ttl_secs {
                return Err(FlareError::configuration_error(format!(
                    "etcd renew interval ({}s) must be positive and shorter than lease ttl ({}s)",
                    etcd.renew_interval_secs, etcd.lease_ttl_secs
                )));
            }
        }
        if self.server.name.trim().is_empty() || self.server.version.trim().is_empty() {
            return Err(FlareError::configuration_error(
                "server name and version are required",
            ));
        }
        if !self.server.reactor && self.server.handle_worker_threads == 0 {
            return Err(FlareError::configuration_error(
                "handle_worker_threads must be positive when reactor mode is disabled",
            ));
        }
        self.client
            .default_load_balancing_policy
            .parse::<crate::resolver::LoadBalancePolicy>()
            .map_err(FlareError::configuration_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_registry_conventions() {
        let etcd = EtcdConfig::default();
        assert_eq!(etcd.lease_ttl(), Duration::from_secs(10));
        assert_eq!(etcd.renew_interval(), Duration::from_secs(9));

        let client = GrpcClientConfig::default();
        assert_eq!(client.max_inbound_message_size, 50 * 1024 * 1024);
        assert_eq!(client.timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn test_parse_partial_file() {
        let config = Config::from_toml_str(
            r#"
            [etcd]
            endpoints = ["http://10.0.0.1:2379"]

            [server]
            name = "example"
            port = 9191
            lb_weight = 42
            reactor = true
            "#,
        )
        .unwrap();

        let etcd = config.etcd.unwrap();
        assert_eq!(etcd.lease_ttl_secs, 10);
        assert_eq!(config.server.port, 9191);
        assert_eq!(config.server.version, "v1.0");
        assert_eq!(config.server.lb_weight(), 10);
        assert!(config.server.reactor);
    }

    #[test]
    fn test_renew_must_be_shorter_than_ttl() {
        let err = Config::from_toml_str(
            r#"
            [etcd]
            endpoints = ["http://10.0.0.1:2379"]
            lease_ttl_secs = 5
            renew_interval_secs = 5
            "#,
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_balancing_policy_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [client]
            default_load_balancing_policy = "least_loaded"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("least_loaded"));
    }

    #[test]
    fn test_weight_is_clamped_low() {
        let server = GrpcServerConfig {
            lb_weight: -3,
            ..Default::default()
        };
        assert_eq!(server.lb_weight(), 1);
    }
}

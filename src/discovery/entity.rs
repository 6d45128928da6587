//! 服务实例定义
//!
//! 注册中心中存储的值就是序列化后的 [`ServiceEntity`]：
//!
//! ```json
//! {"endPoint":"10.0.0.8:9090","host":"10.0.0.8","port":9090,"lbWeight":10,"env":"prod"}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FlareError, Result};

/// 默认负载均衡权重
pub const DEFAULT_LB_WEIGHT: u32 = 10;
/// 权重下限
pub const MIN_LB_WEIGHT: u32 = 1;
/// 权重上限
pub const MAX_LB_WEIGHT: u32 = 10;

/// 将任意输入的权重限制在 [1, 10]
pub fn clamp_weight(weight: i64) -> u32 {
    weight.clamp(MIN_LB_WEIGHT as i64, MAX_LB_WEIGHT as i64) as u32
}

/// 服务实例
///
/// 构造后不可变；`host`/`port` 总是由 `endpoint` 拆分得到。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawServiceEntity", rename_all = "camelCase")]
pub struct ServiceEntity {
    #[serde(rename = "endPoint")]
    endpoint: String,
    host: String,
    port: u16,
    lb_weight: u32,
    env: Option<String>,
}

impl ServiceEntity {
    /// 从 `host:port` 形式的地址创建服务实例
    pub fn new(endpoint: impl Into<String>, lb_weight: i64, env: Option<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let (host, port) = split_endpoint(&endpoint)?;
        Ok(Self {
            endpoint,
            host,
            port,
            lb_weight: clamp_weight(lb_weight),
            env,
        })
    }

    /// 从主机和端口创建服务实例
    pub fn from_parts(
        host: impl Into<String>,
        port: u16,
        lb_weight: i64,
        env: Option<String>,
    ) -> Result<Self> {
        let host = host.into();
        Self::new(format!("{}:{}", host, port), lb_weight, env)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn lb_weight(&self) -> u32 {
        self.lb_weight
    }

    pub fn env(&self) -> Option<&str> {
        self.env.as_deref()
    }

    /// 序列化为注册中心中存储的值
    pub fn to_registry_value(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 从注册中心中存储的值反序列化
    pub fn from_registry_value(value: &[u8]) -> Result<Self> {
        serde_json::from_slice(value)
            .map_err(|e| FlareError::deserialization_error(format!("invalid service entity: {}", e)))
    }
}

impl fmt::Display for ServiceEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(weight={})", self.endpoint, self.lb_weight)
    }
}

/// 拆分 `host:port`，要求恰好一个冒号且端口为数字
fn split_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let mut parts = endpoint.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), None) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| FlareError::invalid_endpoint(endpoint))?;
            Ok((host.to_string(), port))
        }
        _ => Err(FlareError::invalid_endpoint(endpoint)),
    }
}

/// 注册中心中的原始记录，`host`/`port` 可能缺失或与 `endPoint` 不一致
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceEntity {
    #[serde(rename = "endPoint")]
    endpoint: String,
    #[serde(default = "default_weight")]
    lb_weight: i64,
    #[serde(default)]
    env: Option<String>,
}

fn default_weight() -> i64 {
    DEFAULT_LB_WEIGHT as i64
}

impl TryFrom<RawServiceEntity> for ServiceEntity {
    type Error = FlareError;

    fn try_from(raw: RawServiceEntity) -> Result<Self> {
        ServiceEntity::new(raw.endpoint, raw.lb_weight, raw.env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_is_always_clamped() {
        for (input, expected) in [(-5, 1), (0, 1), (1, 1), (7, 7), (10, 10), (11, 10), (i64::MAX, 10)] {
            let entity = ServiceEntity::new("127.0.0.1:9090", input, None).unwrap();
            assert_eq!(entity.lb_weight(), expected, "input weight {input}");
        }
    }

    #[test]
    fn test_endpoint_split() {
        let entity = ServiceEntity::new("10.1.2.3:9090", 5, Some("prod".into())).unwrap();
        assert_eq!(entity.host(), "10.1.2.3");
        assert_eq!(entity.port(), 9090);
        assert_eq!(entity.env(), Some("prod"));
    }

    #[test]
    fn test_invalid_endpoints_are_rejected() {
        for endpoint in ["10.1.2.3", "10.1.2.3:", ":9090", "a:b:c", "host:http", "host:70000"] {
            assert!(
                ServiceEntity::new(endpoint, 10, None).is_err(),
                "{endpoint} should be rejected"
            );
        }
    }

    #[test]
    fn test_registry_value_wire_format() {
        let entity = ServiceEntity::from_parts("10.0.0.8", 9090, 3, Some("test".into())).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&entity.to_registry_value().unwrap()).unwrap();

        assert_eq!(json["endPoint"], "10.0.0.8:9090");
        assert_eq!(json["host"], "10.0.0.8");
        assert_eq!(json["port"], 9090);
        assert_eq!(json["lbWeight"], 3);
        assert_eq!(json["env"], "test");
    }

    #[test]
    fn test_host_and_port_are_rederived_from_endpoint() {
        let value = br#"{"endPoint":"10.0.0.9:7000","host":"stale","port":1,"lbWeight":25,"env":null}"#;
        let entity = ServiceEntity::from_registry_value(value).unwrap();

        assert_eq!(entity.host(), "10.0.0.9");
        assert_eq!(entity.port(), 7000);
        assert_eq!(entity.lb_weight(), 10);
        assert_eq!(entity.env(), None);
    }

    #[test]
    fn test_missing_weight_uses_default() {
        let entity = ServiceEntity::from_registry_value(br#"{"endPoint":"h:1"}"#).unwrap();
        assert_eq!(entity.lb_weight(), DEFAULT_LB_WEIGHT);
    }

    #[test]
    fn test_round_trip_preserves_fields() {
        let entity = ServiceEntity::new("svc.internal:8443", 4, Some("staging".into())).unwrap();
        let decoded =
            ServiceEntity::from_registry_value(entity.to_registry_value().unwrap().as_bytes())
                .unwrap();
        assert_eq!(decoded, entity);
    }
}

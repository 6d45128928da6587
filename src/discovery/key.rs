//! 注册键定义
//!
//! 注册键格式：`<prefix>/<name>/<version>/<protocol>/`，例如 `/services/example/v1.0/grpc/`。
//! 同一个字符串既是服务端注册时写入的 etcd key 前缀，也是客户端解析的逻辑目标。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlareError, Result};

/// 路径分隔符
pub const SEP: &str = "/";
/// 服务注册前缀
pub const SERVICE_PREFIX: &str = "/services";

/// 注册协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "grpc" => Ok(Protocol::Grpc),
            _ => Err(format!("Unknown protocol: {}", s)),
        }
    }
}

/// 注册键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    prefix: String,
    name: String,
    version: String,
    protocol: Protocol,
}

impl ServiceKey {
    /// 创建注册键
    ///
    /// `name`/`version` 不能为空也不能包含 `/`，因此不同的 `(name, version, protocol)` 不会得到相同的键。
    pub fn new(
        prefix: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        protocol: Protocol,
    ) -> Result<Self> {
        let prefix = prefix.into();
        let name = name.into();
        let version = version.into();

        if !prefix.starts_with(SEP) || prefix.ends_with(SEP) {
            return Err(FlareError::invalid_service_key(format!(
                "prefix must start with '/' and not end with '/': {:?}",
                prefix
            )));
        }
        validate_segment("name", &name)?;
        validate_segment("version", &version)?;

        Ok(Self {
            prefix,
            name,
            version,
            protocol,
        })
    }

    /// `/services` 前缀下的 gRPC 注册键
    pub fn grpc(name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        Self::new(SERVICE_PREFIX, name, version, Protocol::Grpc)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEP}{}{SEP}{}{SEP}{}{SEP}",
            self.prefix, self.name, self.version, self.protocol
        )
    }
}

fn validate_segment(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() || value.contains(SEP) {
        return Err(FlareError::invalid_service_key(format!(
            "{} must be non-empty and must not contain '/': {:?}",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_format() {
        let key = ServiceKey::grpc("example", "v1.0").unwrap();
        assert_eq!(key.to_string(), "/services/example/v1.0/grpc/");
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = ServiceKey::new("/services", "event-server", "v2", Protocol::Http).unwrap();
        let b = ServiceKey::new("/services", "event-server", "v2", Protocol::Http).unwrap();
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_distinct_tuples_never_collide() {
        let names = ["a", "b", "ab", "a.b"];
        let versions = ["v1", "v1.0", "1"];
        let protocols = [Protocol::Http, Protocol::Https, Protocol::Grpc];

        let mut seen = HashSet::new();
        for name in names {
            for version in versions {
                for protocol in protocols {
                    let key = ServiceKey::new(SERVICE_PREFIX, name, version, protocol).unwrap();
                    assert!(seen.insert(key.to_string()), "collision for {key}");
                }
            }
        }
        assert_eq!(seen.len(), names.len() * versions.len() * protocols.len());
    }

    #[test]
    fn test_segments_with_separator_are_rejected() {
        assert!(ServiceKey::grpc("a/b", "v1").is_err());
        assert!(ServiceKey::grpc("a", "").is_err());
        assert!(ServiceKey::new("services", "a", "v1", Protocol::Grpc).is_err());
        assert!(ServiceKey::new("/services/", "a", "v1", Protocol::Grpc).is_err());
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("GRPC".parse::<Protocol>().unwrap(), Protocol::Grpc);
        assert!("ftp".parse::<Protocol>().is_err());
    }
}
